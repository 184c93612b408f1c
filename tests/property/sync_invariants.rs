//! Property-based tests for the sync engine's merge rules.
//!
//! Uses proptest to verify:
//! 1. Paging in overlapping conversation pages never duplicates an id and
//!    keeps first-seen order.
//! 2. Every optimistic send resolves to exactly one message, whatever order
//!    and multiplicity its confirmations and echoes arrive in.
//! 3. The message window stays ordered by `sent_at` through confirmations,
//!    inbound pushes and older-page prepends arriving at mixed timestamps.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use deskline::api::{ApiError, ConsoleApi};
use deskline::attachment::{UploadService, UploadTarget};
use deskline::config::{ReconnectConfig, SyncConfig};
use deskline::connection::Connection;
use deskline::conversations::ConversationStore;
use deskline::engine::{Intent, SyncEngine};
use deskline::transport::ScopeKey;
use deskline::transport::loopback::LoopbackConnector;
use deskline_proto::conversation::{
    Conversation, ConversationFilter, ConversationId, ConversationStatus, CustomerId, Platform,
};
use deskline_proto::event::{ConversationPage, Cursor, MessagePage, NewMessage, SendResult, ServerEvent};
use deskline_proto::message::{
    DeliveryStatus, Direction, MessageId, MessageKey, MessageRecord, MessageType, TempId, Timestamp,
};

const ACTIVE: ConversationId = ConversationId::new(42);

fn conv(id: i64) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        platform: Platform::Webchat,
        external_id: format!("web-{id}"),
        display_name: format!("Customer {id}"),
        status: ConversationStatus::Active,
        unread_count: 0,
        last_activity_at: Timestamp::from_millis(1_700_000_000_000 - id),
        last_message: None,
        customer_id: None,
    }
}

// --- Conversation paging ---

fn arb_pages() -> impl Strategy<Value = Vec<Vec<i64>>> {
    prop::collection::vec(prop::collection::vec(1_i64..40, 0..8), 1..6)
}

proptest! {
    #[test]
    fn paging_never_duplicates(pages in arb_pages()) {
        let mut store = ConversationStore::new(8);
        let _ = store.load(ConversationFilter::all());

        let last = pages.len() - 1;
        for (n, ids) in pages.iter().enumerate() {
            if n > 0 {
                prop_assert!(store.load_more().is_some());
            }
            let has_more = n < last;
            store.apply_page(ConversationPage {
                conversations: ids.iter().copied().map(conv).collect(),
                next_cursor: has_more.then(|| Cursor::new(format!("c{n}"))),
                has_more,
            });
        }

        let mut expected: Vec<i64> = Vec::new();
        for id in pages.iter().flatten() {
            if !expected.contains(id) {
                expected.push(*id);
            }
        }
        let actual: Vec<i64> = store.as_slice().iter().map(|c| c.id.get()).collect();
        prop_assert_eq!(actual, expected);
        prop_assert!(!store.has_more());
        prop_assert!(!store.is_loading());
    }
}

// --- Send reconciliation ---

/// REST collaborators are never reached by these tests.
struct Offline;

fn offline() -> ApiError {
    ApiError::Status {
        status: 503,
        message: None,
    }
}

impl ConsoleApi for Offline {
    async fn close_conversation(&self, _id: ConversationId) -> Result<Conversation, ApiError> {
        Err(offline())
    }

    async fn link_customer(&self, _id: ConversationId, _customer: CustomerId) -> Result<Conversation, ApiError> {
        Err(offline())
    }
}

impl UploadService for Offline {
    async fn request_destination(&self, _file_name: &str, _mime: &str) -> Result<UploadTarget, ApiError> {
        Err(offline())
    }

    async fn upload(&self, _target: &UploadTarget, _bytes: Vec<u8>, _mime: &str) -> Result<(), ApiError> {
        Err(offline())
    }
}

/// How the server eventually answers one send.
#[derive(Debug, Clone)]
enum Outcome {
    /// Some mix of `messageResult` successes and `newMessage` echoes
    /// (`true` = echo), with the server's `sent_at`.
    Accepted { signals: Vec<bool>, sent_at: i64 },
    /// One or more `messageResult` failures.
    Rejected { repeats: usize },
}

fn arb_outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => (prop::collection::vec(any::<bool>(), 1..4), 0_i64..1_000_000)
            .prop_map(|(signals, sent_at)| Outcome::Accepted {
                signals,
                sent_at: 1_800_000_000_000 + sent_at,
            }),
        1 => (1_usize..3).prop_map(|repeats| Outcome::Rejected { repeats }),
    ]
}

fn server_id(n: usize) -> MessageId {
    MessageId::new(1_000 + i64::try_from(n).unwrap_or(i64::MAX))
}

fn record(id: MessageId, direction: Direction, sent_at: i64, temp: Option<TempId>) -> MessageRecord {
    MessageRecord {
        id,
        conversation_id: ACTIVE,
        message_type: MessageType::Text,
        direction,
        status: DeliveryStatus::Done,
        content: Some(format!("m{id}")),
        file_url: None,
        file_name: None,
        file_type: None,
        file_size: None,
        thumbnail_url: None,
        sent_at: Timestamp::from_millis(sent_at),
        created_at: None,
        temp_message_id: temp,
    }
}

fn events_for(n: usize, temp: TempId, outcome: &Outcome) -> Vec<Step> {
    match outcome {
        Outcome::Accepted { signals, sent_at } => signals
            .iter()
            .map(|&echo| {
                Step::Event(if echo {
                    ServerEvent::NewMessage(NewMessage {
                        message: record(server_id(n), Direction::Outgoing, *sent_at, Some(temp)),
                        conversation: None,
                    })
                } else {
                    ServerEvent::MessageResult(SendResult {
                        success: true,
                        temp_message_id: Some(temp),
                        message_id: Some(server_id(n)),
                        sent_at: Some(Timestamp::from_millis(*sent_at)),
                        error: None,
                        message: None,
                    })
                })
            })
            .collect(),
        Outcome::Rejected { repeats } => (0..*repeats)
            .map(|_| {
                Step::Event(ServerEvent::MessageResult(SendResult {
                    success: false,
                    temp_message_id: Some(temp),
                    message_id: None,
                    sent_at: None,
                    error: Some("PLATFORM_ERROR".into()),
                    message: Some("Delivery failed".into()),
                }))
            })
            .collect(),
    }
}

/// One input to the engine.
enum Step {
    Event(ServerEvent),
    /// Ask for older history, then deliver `page` as the reply.
    Older(MessagePage),
}

/// Server history and live customer traffic around the sends.
#[derive(Debug, Clone)]
struct Traffic {
    initial: Vec<i64>,
    older: Vec<Vec<i64>>,
    inbound: Vec<i64>,
}

fn arb_sent_at() -> impl Strategy<Value = i64> {
    (0_i64..1_000_000).prop_map(|at| 1_800_000_000_000 + at)
}

fn arb_traffic() -> impl Strategy<Value = Traffic> {
    (
        prop::collection::vec(arb_sent_at(), 0..6),
        prop::collection::vec(prop::collection::vec(arb_sent_at(), 0..4), 0..3),
        prop::collection::vec(arb_sent_at(), 0..8),
    )
        .prop_map(|(initial, older, inbound)| Traffic {
            initial,
            older,
            inbound,
        })
}

/// Hands out server ids for history and inbound messages, clear of the
/// ids used for sends.
struct Ids(i64);

impl Ids {
    fn fresh(&mut self) -> MessageId {
        self.0 += 1;
        MessageId::new(self.0)
    }
}

/// Interleave per-source step lists using `picks` to choose which source
/// delivers next. Each source's own steps keep their relative order.
fn interleave(mut queues: Vec<Vec<Step>>, picks: &[usize]) -> Vec<Step> {
    for queue in &mut queues {
        queue.reverse();
    }
    let mut out = Vec::new();
    let mut picks = picks.iter().cycle();
    while queues.iter().any(|q| !q.is_empty()) {
        let live: Vec<usize> = (0..queues.len()).filter(|&i| !queues[i].is_empty()).collect();
        let pick = picks.next().copied().unwrap_or(0) % live.len();
        if let Some(event) = queues[live[pick]].pop() {
            out.push(event);
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_send_resolves_exactly_once(
        outcomes in prop::collection::vec(arb_outcome(), 1..6),
        traffic in arb_traffic(),
        picks in prop::collection::vec(0_usize..16, 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (connector, _backends) = LoopbackConnector::new(256);
            let policy = ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                max_attempts: 1,
            };
            let connection = Connection::open(ScopeKey::new("prop"), Arc::new(connector), policy);
            let config = SyncConfig {
                notification_duration: Duration::from_secs(60),
                ..SyncConfig::default()
            };
            let (mut engine, _snapshots) =
                SyncEngine::new(connection, Arc::new(Offline), Arc::new(Offline), &config);
            let now = Instant::now();
            let mut ids = Ids(100_000);

            engine.handle_event(
                ServerEvent::ConversationsList(ConversationPage {
                    conversations: vec![conv(ACTIVE.get())],
                    next_cursor: None,
                    has_more: false,
                }),
                now,
            );
            engine.handle_intent(Intent::Select(Some(ACTIVE)), now);
            let has_older = !traffic.older.is_empty();
            engine.handle_event(
                ServerEvent::MessagesList(MessagePage {
                    conversation_id: ACTIVE,
                    messages: traffic
                        .initial
                        .iter()
                        .map(|&at| record(ids.fresh(), Direction::Incoming, at, None))
                        .collect(),
                    next_cursor: has_older.then(|| Cursor::new("older-0")),
                    has_more: has_older,
                }),
                now,
            );

            let mut temps = Vec::new();
            for n in 0..outcomes.len() {
                engine.handle_intent(Intent::SendText(format!("send {n}")), now);
                let snapshot = engine.snapshot();
                let temp = snapshot
                    .messages
                    .iter()
                    .filter_map(|m| m.key.temp_id())
                    .find(|t| !temps.contains(t));
                prop_assert!(temp.is_some());
                temps.extend(temp);
            }

            let mut queues: Vec<Vec<Step>> = outcomes
                .iter()
                .enumerate()
                .map(|(n, outcome)| events_for(n, temps[n], outcome))
                .collect();
            for &at in &traffic.inbound {
                queues.push(vec![Step::Event(ServerEvent::NewMessage(NewMessage {
                    message: record(ids.fresh(), Direction::Incoming, at, None),
                    conversation: None,
                }))]);
            }
            let last = traffic.older.len().saturating_sub(1);
            queues.push(
                traffic
                    .older
                    .iter()
                    .enumerate()
                    .map(|(n, page)| {
                        let has_more = n < last;
                        Step::Older(MessagePage {
                            conversation_id: ACTIVE,
                            messages: page
                                .iter()
                                .map(|&at| record(ids.fresh(), Direction::Incoming, at, None))
                                .collect(),
                            next_cursor: has_more.then(|| Cursor::new(format!("older-{}", n + 1))),
                            has_more,
                        })
                    })
                    .collect(),
            );

            for step in interleave(queues, &picks) {
                match step {
                    Step::Event(event) => engine.handle_event(event, now),
                    Step::Older(page) => {
                        engine.handle_intent(Intent::LoadOlderMessages, now);
                        engine.handle_event(ServerEvent::MessagesList(page), now);
                    }
                }
            }

            let history = traffic.initial.len()
                + traffic.older.iter().map(Vec::len).sum::<usize>()
                + traffic.inbound.len();
            let messages = engine.snapshot().messages;
            prop_assert_eq!(messages.len(), outcomes.len() + history);
            for (n, outcome) in outcomes.iter().enumerate() {
                let pending = MessageKey::Pending(temps[n]);
                let confirmed = MessageKey::Confirmed(server_id(n));
                let entries: Vec<_> = messages
                    .iter()
                    .filter(|m| m.key == pending || m.key == confirmed)
                    .collect();
                prop_assert_eq!(entries.len(), 1);
                match outcome {
                    Outcome::Accepted { sent_at, .. } => {
                        prop_assert_eq!(&entries[0].key, &confirmed);
                        prop_assert_eq!(entries[0].status, DeliveryStatus::Done);
                        prop_assert_eq!(entries[0].sent_at, Timestamp::from_millis(*sent_at));
                    }
                    Outcome::Rejected { .. } => {
                        prop_assert_eq!(&entries[0].key, &pending);
                        prop_assert_eq!(entries[0].status, DeliveryStatus::Failed);
                    }
                }
            }
            prop_assert!(messages.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
            prop_assert!(!engine.snapshot().messages_loading);
            Ok(())
        })?;
    }
}
