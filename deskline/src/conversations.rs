//! Filtered, paged, most-recent-first list of conversations.

use deskline_proto::conversation::{Conversation, ConversationFilter, ConversationId, MessagePreview};
use deskline_proto::event::{Command, ConversationPage, ConversationsQuery};

use crate::paging::{PageRequest, Pager};

/// What an upsert did to the filtered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// New entry, placed at the front.
    Inserted,
    /// Existing entry merged (and moved to the front if it saw new activity).
    Updated,
    /// Existing entry no longer matches the filter and left the view.
    Removed,
    /// Not in the view and does not match the filter.
    Ignored,
}

/// The conversation list for the current filter.
#[derive(Debug)]
pub struct ConversationStore {
    items: Vec<Conversation>,
    filter: ConversationFilter,
    pager: Pager,
    page_size: u32,
}

impl ConversationStore {
    /// Create an empty store that requests `page_size` conversations per page.
    #[must_use]
    pub fn new(page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            filter: ConversationFilter::default(),
            pager: Pager::default(),
            page_size,
        }
    }

    /// Switch to `filter` and request its first page.
    ///
    /// The current entries stay visible until the reply replaces them.
    pub fn load(&mut self, filter: ConversationFilter) -> Command {
        self.filter = filter;
        self.pager.begin_initial();
        tracing::debug!(filter = %filter, "loading conversations");
        self.query(None)
    }

    /// Request the first page again with the current filter.
    pub fn reload(&mut self) -> Command {
        self.load(self.filter)
    }

    /// Reload on a new transport. Requests sent on the old one are
    /// forgotten.
    pub fn resync(&mut self) -> Command {
        self.pager.forget_in_flight();
        self.reload()
    }

    /// Request the next page, unless one is in flight or none remain.
    pub fn load_more(&mut self) -> Option<Command> {
        let cursor = self.pager.begin_next()?;
        tracing::debug!(cursor = %cursor, "loading more conversations");
        Some(self.query(Some(cursor)))
    }

    fn query(&self, cursor: Option<deskline_proto::event::Cursor>) -> Command {
        Command::GetConversations(ConversationsQuery {
            limit: self.page_size,
            status: self.filter.status,
            platform: self.filter.platform,
            cursor,
        })
    }

    /// Apply a `conversationsList` reply. Returns how many entries were added.
    ///
    /// An initial page replaces the list; a follow-up page appends only ids
    /// not already present. A reply to a superseded request changes nothing.
    pub fn apply_page(&mut self, page: ConversationPage) -> usize {
        let Some(request) = self.pager.finish(page.next_cursor, page.has_more) else {
            return 0;
        };
        if request == PageRequest::Initial {
            self.items.clear();
        }
        let before = self.items.len();
        for conversation in page.conversations {
            if !self.contains(conversation.id) {
                self.items.push(conversation);
            }
        }
        self.items.len() - before
    }

    /// Merge a conversation pushed by the server or returned by the API.
    pub fn upsert(&mut self, conversation: Conversation) -> Upsert {
        let matches = self.filter.matches(&conversation);
        match self.position(conversation.id) {
            Some(index) if !matches => {
                self.items.remove(index);
                Upsert::Removed
            }
            Some(index) => {
                let newer = conversation.last_activity_at > self.items[index].last_activity_at;
                self.items[index] = conversation;
                if newer {
                    self.move_to_front(index);
                }
                Upsert::Updated
            }
            None if matches => {
                self.items.insert(0, conversation);
                Upsert::Inserted
            }
            None => Upsert::Ignored,
        }
    }

    /// Record new activity on a conversation and move it to the front.
    ///
    /// Returns `false` if the conversation is not in the view.
    pub fn touch(&mut self, id: ConversationId, preview: MessagePreview, count_unread: bool) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let entry = &mut self.items[index];
        if preview.sent_at > entry.last_activity_at {
            entry.last_activity_at = preview.sent_at;
        }
        entry.last_message = Some(preview);
        if count_unread {
            entry.unread_count = entry.unread_count.saturating_add(1);
        }
        self.move_to_front(index);
        true
    }

    /// Apply a read receipt. Returns `false` if the conversation is unknown.
    pub fn mark_read(&mut self, id: ConversationId) -> bool {
        self.get_mut(id).is_some_and(|c| {
            c.unread_count = 0;
            true
        })
    }

    /// Change a conversation locally, returning its previous value.
    ///
    /// The edited entry leaves the view if it no longer matches the filter.
    pub fn edit(&mut self, id: ConversationId, f: impl FnOnce(&mut Conversation)) -> Option<Conversation> {
        let index = self.position(id)?;
        let previous = self.items[index].clone();
        f(&mut self.items[index]);
        if !self.filter.matches(&self.items[index]) {
            self.items.remove(index);
        }
        Some(previous)
    }

    fn move_to_front(&mut self, index: usize) {
        if index > 0 {
            let entry = self.items.remove(index);
            self.items.insert(0, entry);
        }
    }

    fn position(&self, id: ConversationId) -> Option<usize> {
        self.items.iter().position(|c| c.id == id)
    }

    fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.items.iter_mut().find(|c| c.id == id)
    }

    #[must_use]
    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| c.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: ConversationId) -> bool {
        self.position(id).is_some()
    }

    /// Entries in display order, most recently active first.
    #[must_use]
    pub fn as_slice(&self) -> &[Conversation] {
        &self.items
    }

    #[must_use]
    pub const fn filter(&self) -> ConversationFilter {
        self.filter
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.pager.is_loading()
    }

    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.pager.has_more()
    }
}
