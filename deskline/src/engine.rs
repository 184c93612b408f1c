//! The sync engine: one event loop that owns every store.
//!
//! Inputs are user [`Intent`]s, [`ServerEvent`]s from the connection,
//! [`Completion`]s reported by background tasks, and connection health
//! changes. Each input is applied by a synchronous `&mut self` handler, so
//! handlers never interleave. After every input the engine publishes a fresh
//! [`Snapshot`] on a `watch` channel.
//!
//! ```text
//! intents ──► SyncEngine ──► Connection::emit ──► backend
//!                ▲   │
//!   events ──────┘   └──► spawned REST / upload tasks ──► completions
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use deskline_proto::conversation::{
    Conversation, ConversationFilter, ConversationId, ConversationStatus, CustomerId,
};
use deskline_proto::event::{
    Command, ConversationRef, EventKind, MessagePage, NewMessage, SendResult, ServerEvent,
};
use deskline_proto::message::{Direction, MessageId, TempId, Timestamp};

use crate::api::{ApiError, ConsoleApi};
use crate::attachment::{self, AttachmentError, AttachmentJob, OutgoingFile, UploadService};
use crate::config::SyncConfig;
use crate::connection::{Connection, ConnectionState, EventFilter, Subscription};
use crate::conversations::ConversationStore;
use crate::messages::{Message, MessageStore};
use crate::notify::{Notice, Notifier};
use crate::outbox::{Outbox, Transition};
use crate::selection::{Selection, Want};

/// Events the engine consumes from the connection.
const SUBSCRIBED: [EventKind; 9] = [
    EventKind::Ready,
    EventKind::ConversationsList,
    EventKind::Conversation,
    EventKind::MessagesList,
    EventKind::NewMessage,
    EventKind::MessageResult,
    EventKind::MessagesMarkedRead,
    EventKind::Error,
    EventKind::Disconnect,
];

/// Something the user asked for.
#[derive(Debug, Clone)]
pub enum Intent {
    SetFilter(ConversationFilter),
    LoadMoreConversations,
    /// Open a loaded conversation, or close the open one with `None`.
    Select(Option<ConversationId>),
    LoadOlderMessages,
    SendText(String),
    SendAttachment(OutgoingFile),
    /// Open a conversation as soon as it shows up in the list.
    OpenConversation(ConversationId),
    /// Open the conversation linked to a customer as soon as it shows up.
    OpenCustomer(CustomerId),
    LinkCustomer {
        conversation: ConversationId,
        customer: CustomerId,
    },
    CloseConversation(ConversationId),
    DismissNotice,
    Shutdown,
}

/// A REST action on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationAction {
    Close,
    LinkCustomer(CustomerId),
}

impl ConversationAction {
    fn apply(self, conversation: &mut Conversation) {
        match self {
            Self::Close => conversation.status = ConversationStatus::Closed,
            Self::LinkCustomer(customer) => conversation.customer_id = Some(customer),
        }
    }

    const fn success_message(self) -> &'static str {
        match self {
            Self::Close => "Conversation closed",
            Self::LinkCustomer(_) => "Customer linked",
        }
    }
}

/// Outcome of a background task, fed back into the engine.
#[derive(Debug)]
pub enum Completion {
    Attachment {
        temp_id: TempId,
        result: Result<String, AttachmentError>,
    },
    Action {
        id: ConversationId,
        action: ConversationAction,
        /// State before the optimistic change, restored on failure.
        previous: Conversation,
        result: Result<Conversation, ApiError>,
    },
}

/// Immutable view of everything the UI renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    pub filter: ConversationFilter,
    pub conversations_loading: bool,
    pub has_more_conversations: bool,
    pub active: Option<ConversationId>,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub messages_loading: bool,
    pub has_older_messages: bool,
    /// Any attachment upload in flight.
    pub uploading: bool,
    pub connection: ConnectionState,
    pub notice: Option<Notice>,
}

/// Owns the stores and applies every input to them.
pub struct SyncEngine<A, U> {
    connection: Arc<Connection>,
    subscription: Subscription,
    api: Arc<A>,
    uploads: Arc<U>,
    conversations: ConversationStore,
    messages: MessageStore,
    outbox: Outbox,
    selection: Selection,
    notifier: Notifier,
    connection_state: ConnectionState,
    uploads_in_flight: usize,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshots: watch::Sender<Snapshot>,
}

impl<A: ConsoleApi, U: UploadService> SyncEngine<A, U> {
    /// Create an engine on `connection` and the receiver its snapshots are
    /// published on.
    pub fn new(
        connection: Arc<Connection>,
        api: Arc<A>,
        uploads: Arc<U>,
        config: &SyncConfig,
    ) -> (Self, watch::Receiver<Snapshot>) {
        let subscription = connection.subscribe(EventFilter::only(SUBSCRIBED));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(Snapshot::default());
        let connection_state = connection.state();

        let engine = Self {
            connection,
            subscription,
            api,
            uploads,
            conversations: ConversationStore::new(config.conversation_page_size),
            messages: MessageStore::new(config.message_page_size),
            outbox: Outbox::new(),
            selection: Selection::default(),
            notifier: Notifier::new(config.notification_duration),
            connection_state,
            uploads_in_flight: 0,
            completions_tx,
            completions_rx,
            snapshots,
        };
        (engine, snapshot_rx)
    }

    /// Issue the first conversation load if the connection came up before
    /// the engine subscribed.
    ///
    /// Otherwise the load happens on the first `ready`.
    pub fn start(&mut self, now: Instant) {
        if self.subscription.missed_ready() {
            let command = self.conversations.reload();
            self.emit(command, now);
        }
    }

    /// Run the event loop until [`Intent::Shutdown`] or the intent channel
    /// closes.
    ///
    /// The engine's subscription is dropped before this returns, so the
    /// caller can disconnect the connection afterwards.
    pub async fn run(mut self, mut intents: mpsc::Receiver<Intent>) {
        let mut state_rx = self.connection.watch_state();
        let mut events_open = true;
        let mut state_open = true;

        let state = state_rx.borrow_and_update().clone();
        self.handle_connection_state(state, Instant::now());
        self.start(Instant::now());
        self.publish();
        tracing::info!(scope = %self.connection.scope(), "sync engine running");

        loop {
            let deadline = self.notifier.deadline();
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => {
                        if !self.handle_intent(intent, Instant::now()) {
                            break;
                        }
                    }
                    None => break,
                },
                event = self.subscription.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => {
                        tracing::warn!("connection event stream ended");
                        events_open = false;
                    }
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion, Instant::now());
                }
                changed = state_rx.changed(), if state_open => {
                    if changed.is_ok() {
                        let state = state_rx.borrow_and_update().clone();
                        self.handle_connection_state(state, Instant::now());
                    } else {
                        state_open = false;
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_notice(Instant::now());
                }
            }
            self.publish();
        }

        let Self { subscription, .. } = self;
        drop(subscription);
        tracing::info!("sync engine stopped");
    }

    /// Apply a user intent. Returns `false` on [`Intent::Shutdown`].
    pub fn handle_intent(&mut self, intent: Intent, now: Instant) -> bool {
        tracing::debug!(?intent, "intent");
        match intent {
            Intent::SetFilter(filter) => self.set_filter(filter, now),
            Intent::LoadMoreConversations => {
                if let Some(command) = self.conversations.load_more() {
                    self.emit(command, now);
                }
            }
            Intent::Select(id) => self.select(id, now),
            Intent::LoadOlderMessages => {
                if let Some(command) = self.messages.load_older() {
                    self.emit(command, now);
                }
            }
            Intent::SendText(text) => self.send_text(&text, now),
            Intent::SendAttachment(file) => self.send_attachment(file, now),
            Intent::OpenConversation(id) => self.want(Want::Conversation(id), now),
            Intent::OpenCustomer(customer) => self.want(Want::Customer(customer), now),
            Intent::LinkCustomer {
                conversation,
                customer,
            } => self.run_action(conversation, ConversationAction::LinkCustomer(customer), now),
            Intent::CloseConversation(id) => self.run_action(id, ConversationAction::Close, now),
            Intent::DismissNotice => {
                self.notifier.dismiss();
            }
            Intent::Shutdown => return false,
        }
        true
    }

    /// Apply a server event.
    pub fn handle_event(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::Ready => self.resync(now),
            ServerEvent::ConversationsList(page) => {
                let added = self.conversations.apply_page(page);
                tracing::debug!(added, total = self.conversations.as_slice().len(), "conversations page");
                self.reconcile_selection(now);
            }
            ServerEvent::Conversation(push) => {
                let outcome = self.conversations.upsert(push.conversation);
                tracing::debug!(?outcome, "conversation pushed");
                self.reconcile_selection(now);
            }
            ServerEvent::MessagesList(page) => self.on_messages_page(page),
            ServerEvent::NewMessage(new) => self.on_new_message(new, now),
            ServerEvent::MessageResult(result) => self.on_send_result(&result, now),
            ServerEvent::MessagesMarkedRead(read) => {
                self.conversations.mark_read(read.conversation_id);
            }
            ServerEvent::Error(err) => {
                tracing::warn!(error = %err, "server error event");
                self.notifier.failure(err.to_string(), now);
            }
            ServerEvent::Disconnect(reason) => {
                tracing::info!(reason = %reason.reason, intentional = reason.is_intentional(), "disconnect event");
                if !reason.is_intentional() {
                    self.notifier.failure(format!("disconnected: {}", reason.reason), now);
                }
            }
        }
    }

    /// Apply a background task outcome.
    pub fn handle_completion(&mut self, completion: Completion, now: Instant) {
        match completion {
            Completion::Attachment { temp_id, result } => {
                self.uploads_in_flight = self.uploads_in_flight.saturating_sub(1);
                match result {
                    Ok(url) => {
                        self.messages.set_attachment_url(temp_id, url);
                    }
                    Err(e) => {
                        tracing::warn!(temp = %temp_id, err = %e, "attachment failed");
                        self.fail_send(temp_id, e.to_string(), now);
                    }
                }
            }
            Completion::Action {
                id,
                action,
                previous,
                result,
            } => match result {
                Ok(conversation) => {
                    self.conversations.upsert(conversation);
                    self.notifier.success(action.success_message(), now);
                }
                Err(e) => {
                    tracing::warn!(conversation = %id, ?action, err = %e, "conversation action failed, rolling back");
                    self.conversations.upsert(previous);
                    self.notifier.failure(e.user_message(), now);
                }
            },
        }
        self.reconcile_selection(now);
    }

    /// Apply a connection health change. A new establishment failure or a
    /// give-up raises a failure notice; server `error` and `disconnect`
    /// events raise their own in [`Self::handle_event`].
    pub fn handle_connection_state(&mut self, state: ConnectionState, now: Instant) {
        let fresh_error = state
            .link_error
            .as_ref()
            .filter(|e| self.connection_state.link_error.as_ref() != Some(*e))
            .cloned();
        self.connection_state = state;
        if let Some(error) = fresh_error {
            self.notifier.failure(error, now);
        }
    }

    /// Drop the notice if its time is up.
    pub fn expire_notice(&mut self, now: Instant) {
        self.notifier.expire(now);
    }

    /// Wait for the next background task outcome.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions_rx.recv().await
    }

    /// Build the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            conversations: self.conversations.as_slice().to_vec(),
            filter: self.conversations.filter(),
            conversations_loading: self.conversations.is_loading(),
            has_more_conversations: self.conversations.has_more(),
            active: self.selection.active(),
            messages: self.messages.as_slice().to_vec(),
            messages_loading: self.messages.is_loading(),
            has_older_messages: self.messages.has_more(),
            uploading: self.uploads_in_flight > 0,
            connection: self.connection_state.clone(),
            notice: self.notifier.current().cloned(),
        }
    }

    /// Publish the current snapshot if it changed.
    pub fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    fn set_filter(&mut self, filter: ConversationFilter, now: Instant) {
        let command = self.conversations.load(filter);
        self.emit(command, now);

        // A loaded active conversation that the new filter excludes is
        // dropped right away rather than when the reply lands.
        if let Some(active) = self.selection.active()
            && self
                .conversations
                .get(active)
                .is_some_and(|c| !filter.matches(c))
        {
            self.selection.select(None);
            self.activate(None, now);
        }
    }

    fn select(&mut self, id: Option<ConversationId>, now: Instant) {
        if let Some(id) = id
            && !self.conversations.contains(id)
        {
            tracing::debug!(conversation = %id, "ignoring selection outside the list");
            return;
        }
        if self.selection.select(id) {
            self.activate(id, now);
        }
    }

    fn want(&mut self, want: Want, now: Instant) {
        self.selection.want(want);
        self.reconcile_selection(now);
    }

    fn send_text(&mut self, text: &str, now: Instant) {
        match self.outbox.compose_text(self.selection.active(), text) {
            Ok((message, command)) => {
                let Some(temp) = message.key.temp_id() else {
                    return;
                };
                self.show_pending(message);
                if let Err(e) = self.connection.emit(command) {
                    self.fail_send(temp, format!("Message not sent: {e}"), now);
                }
            }
            Err(rejection) if rejection.is_silent() => {}
            Err(rejection) => self.notifier.failure(rejection.to_string(), now),
        }
    }

    fn send_attachment(&mut self, file: OutgoingFile, now: Instant) {
        let message_type = attachment::classify(&file.mime_type);
        let message = match self
            .outbox
            .compose_attachment(self.selection.active(), message_type, &file)
        {
            Ok(message) => message,
            Err(rejection) => {
                self.notifier.failure(rejection.to_string(), now);
                return;
            }
        };
        let Some(temp_id) = message.key.temp_id() else {
            return;
        };
        let job = AttachmentJob {
            temp_id,
            conversation_id: message.conversation_id,
            message_type,
            file,
        };
        self.show_pending(message);
        self.uploads_in_flight += 1;

        let uploads = Arc::clone(&self.uploads);
        let connection = Arc::clone(&self.connection);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = attachment::run_pipeline(uploads.as_ref(), &connection, job).await;
            let _ = completions.send(Completion::Attachment { temp_id, result });
        });
    }

    fn show_pending(&mut self, message: Message) {
        self.conversations
            .touch(message.conversation_id, message.preview(), false);
        self.messages.push_pending(message);
    }

    fn run_action(&mut self, id: ConversationId, action: ConversationAction, now: Instant) {
        let Some(previous) = self.conversations.edit(id, |c| action.apply(c)) else {
            self.notifier
                .failure(format!("Conversation {id} is not loaded"), now);
            return;
        };
        self.reconcile_selection(now);

        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = match action {
                ConversationAction::Close => api.close_conversation(id).await,
                ConversationAction::LinkCustomer(customer) => api.link_customer(id, customer).await,
            };
            let _ = completions.send(Completion::Action {
                id,
                action,
                previous,
                result,
            });
        });
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Reload after (re)connecting: the list with the current filter, and
    /// the open conversation.
    fn resync(&mut self, now: Instant) {
        let command = self.conversations.resync();
        self.emit(command, now);
        for command in self.messages.resync() {
            self.emit(command, now);
        }
    }

    fn on_messages_page(&mut self, page: MessagePage) {
        // History can carry a send whose result was lost with the old transport.
        if self.messages.active() == Some(page.conversation_id) {
            for record in &page.messages {
                if let Some(temp) = record.temp_message_id {
                    self.confirm_send(temp, record.id, Some(record.sent_at));
                }
            }
        }
        self.messages.apply_page(page);
    }

    fn on_new_message(&mut self, new: NewMessage, now: Instant) {
        let NewMessage {
            message: record,
            conversation,
        } = new;
        let conversation_id = record.conversation_id;
        let id = record.id;
        let direction = record.direction;
        let sent_at = record.sent_at;
        let echo = record
            .temp_message_id
            .filter(|temp| self.outbox.state(*temp).is_some());
        let is_active = self.selection.active() == Some(conversation_id);
        let message = Message::from(record);
        let preview = message.preview();

        if let Some(temp) = echo {
            self.confirm_send(temp, id, Some(sent_at));
        }
        if is_active
            && self.messages.append_incoming(message)
            && direction == Direction::Incoming
        {
            self.emit(
                Command::MarkMessagesRead(ConversationRef { conversation_id }),
                now,
            );
        }

        match conversation {
            Some(conversation) => {
                self.conversations.upsert(conversation);
            }
            None => {
                let count_unread = direction == Direction::Incoming && !is_active;
                self.conversations
                    .touch(conversation_id, preview, count_unread);
            }
        }
        self.reconcile_selection(now);
    }

    fn on_send_result(&mut self, result: &SendResult, now: Instant) {
        let Some(temp) = result.temp_message_id else {
            tracing::warn!("messageResult without tempMessageId");
            return;
        };
        if !result.success {
            self.fail_send(temp, result.failure_reason().to_string(), now);
            return;
        }
        match result.message_id {
            Some(id) => self.confirm_send(temp, id, result.sent_at),
            None => tracing::warn!(temp = %temp, "confirmation without messageId"),
        }
    }

    fn confirm_send(&mut self, temp: TempId, id: MessageId, sent_at: Option<Timestamp>) {
        if self.outbox.confirm(temp, id) == Transition::Applied {
            self.messages.confirm(temp, id, sent_at);
            tracing::debug!(temp = %temp, id = %id, "send confirmed");
        }
    }

    fn fail_send(&mut self, temp: TempId, reason: String, now: Instant) {
        if self.outbox.fail(temp) == Transition::Applied {
            self.messages.fail(temp);
            self.notifier.failure(reason, now);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn activate(&mut self, id: Option<ConversationId>, now: Instant) {
        for command in self.messages.activate(id) {
            self.emit(command, now);
        }
    }

    fn reconcile_selection(&mut self, now: Instant) {
        if let Some(active) = self.selection.reconcile(self.conversations.as_slice()) {
            self.activate(active, now);
        }
    }

    fn emit(&mut self, command: Command, now: Instant) {
        if let Err(e) = self.connection.emit(command) {
            tracing::warn!(err = %e, "could not queue command");
            self.notifier
                .failure(format!("Could not reach the server: {e}"), now);
        }
    }
}
