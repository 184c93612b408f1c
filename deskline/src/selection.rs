//! Active conversation and deep-link wants.

use deskline_proto::conversation::{Conversation, ConversationId, CustomerId};

/// A conversation the user asked to open before it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Conversation(ConversationId),
    Customer(CustomerId),
}

impl Want {
    fn matches(self, conversation: &Conversation) -> bool {
        match self {
            Self::Conversation(id) => conversation.id == id,
            Self::Customer(customer) => conversation.customer_id == Some(customer),
        }
    }
}

/// Which conversation is open, and which one is wanted.
#[derive(Debug, Default)]
pub struct Selection {
    active: Option<ConversationId>,
    want: Option<Want>,
}

impl Selection {
    #[must_use]
    pub const fn active(&self) -> Option<ConversationId> {
        self.active
    }

    #[must_use]
    pub const fn wanted(&self) -> Option<Want> {
        self.want
    }

    /// Set the active conversation. Returns `true` if it changed.
    pub fn select(&mut self, id: Option<ConversationId>) -> bool {
        if self.active == id {
            return false;
        }
        tracing::debug!(from = ?self.active, to = ?id, "selection changed");
        self.active = id;
        true
    }

    /// Remember a conversation to open once it appears.
    pub fn want(&mut self, want: Want) {
        self.want = Some(want);
    }

    /// Bring the selection in line with the visible list.
    ///
    /// Clears the active id if it left the list, then applies a pending want
    /// if a matching entry is present. Returns the new active id when it
    /// changed.
    pub fn reconcile(&mut self, visible: &[Conversation]) -> Option<Option<ConversationId>> {
        let before = self.active;

        if let Some(id) = self.active
            && !visible.iter().any(|c| c.id == id)
        {
            self.active = None;
        }

        if let Some(want) = self.want
            && let Some(found) = visible.iter().find(|c| want.matches(c))
        {
            tracing::debug!(?want, conversation = %found.id, "deep link resolved");
            self.active = Some(found.id);
            self.want = None;
        }

        (self.active != before).then_some(self.active)
    }
}
