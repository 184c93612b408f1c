//! Property-based tests for the JSON wire codec.
//!
//! Uses proptest to verify:
//! 1. Conversation pages and message records survive encode → decode.
//! 2. Send results keep their correlation id through the codec.
//! 3. Arbitrary text never causes a panic in `decode_event` / `decode_command`.

use deskline_proto::codec;
use deskline_proto::conversation::*;
use deskline_proto::event::*;
use deskline_proto::message::*;
use proptest::prelude::*;
use uuid::Uuid;

// --- Strategies for protocol types ---

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    // 2000-01-01 .. 2100-01-01, whole milliseconds.
    (946_684_800_000_i64..4_102_444_800_000).prop_map(Timestamp::from_millis)
}

fn arb_temp_id() -> impl Strategy<Value = TempId> {
    any::<u128>().prop_map(|n| TempId::from_uuid(Uuid::from_u128(n)))
}

fn arb_platform() -> impl Strategy<Value = Platform> {
    prop_oneof![
        Just(Platform::Instagram),
        Just(Platform::Telegram),
        Just(Platform::Line),
        Just(Platform::Facebook),
        Just(Platform::Whatsapp),
        Just(Platform::Webchat),
    ]
}

fn arb_status() -> impl Strategy<Value = ConversationStatus> {
    prop_oneof![
        Just(ConversationStatus::Active),
        Just(ConversationStatus::Closed)
    ]
}

fn arb_conversation() -> impl Strategy<Value = Conversation> {
    (
        any::<i64>(),
        arb_platform(),
        "[a-z0-9]{1,12}",
        ".{0,24}",
        arb_status(),
        any::<u32>(),
        arb_timestamp(),
        proptest::option::of(any::<i64>()),
    )
        .prop_map(
            |(id, platform, external_id, display_name, status, unread, at, customer)| {
                Conversation {
                    id: ConversationId::new(id),
                    platform,
                    external_id,
                    display_name,
                    status,
                    unread_count: unread,
                    last_activity_at: at,
                    last_message: None,
                    customer_id: customer.map(CustomerId::new),
                }
            },
        )
}

fn arb_text_record() -> impl Strategy<Value = MessageRecord> {
    (
        any::<i64>(),
        any::<i64>(),
        prop_oneof![Just(Direction::Incoming), Just(Direction::Outgoing)],
        ".{1,64}",
        arb_timestamp(),
        proptest::option::of(arb_temp_id()),
    )
        .prop_map(|(id, conv, direction, content, sent_at, temp)| MessageRecord {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conv),
            message_type: MessageType::Text,
            direction,
            status: DeliveryStatus::Done,
            content: Some(content),
            file_url: None,
            file_name: None,
            file_type: None,
            file_size: None,
            thumbnail_url: None,
            sent_at,
            created_at: Some(sent_at),
            temp_message_id: temp,
        })
}

// --- Property tests ---

proptest! {
    /// Conversation list replies survive the codec intact.
    #[test]
    fn conversation_page_round_trip(
        conversations in prop::collection::vec(arb_conversation(), 0..8),
        cursor in proptest::option::of("[a-zA-Z0-9]{1,16}"),
        has_more in any::<bool>(),
    ) {
        let event = ServerEvent::ConversationsList(ConversationPage {
            conversations,
            next_cursor: cursor.map(Cursor::new),
            has_more,
        });
        let frame = codec::encode_event(&event).expect("encode should succeed");
        let decoded = codec::decode_event(&frame).expect("decode should succeed");
        prop_assert_eq!(event, decoded);
    }

    /// Message pages survive the codec intact, preserving order.
    #[test]
    fn message_page_round_trip(messages in prop::collection::vec(arb_text_record(), 0..8)) {
        let event = ServerEvent::MessagesList(MessagePage {
            conversation_id: ConversationId::new(42),
            messages,
            next_cursor: None,
            has_more: false,
        });
        let frame = codec::encode_event(&event).expect("encode should succeed");
        let decoded = codec::decode_event(&frame).expect("decode should succeed");
        prop_assert_eq!(event, decoded);
    }

    /// A send confirmation keeps its correlation id and server id.
    #[test]
    fn send_result_keeps_correlation(temp in arb_temp_id(), id in any::<i64>()) {
        let event = ServerEvent::MessageResult(SendResult {
            success: true,
            temp_message_id: Some(temp),
            message_id: Some(MessageId::new(id)),
            sent_at: None,
            error: None,
            message: None,
        });
        let frame = codec::encode_event(&event).expect("encode should succeed");
        let ServerEvent::MessageResult(result) =
            codec::decode_event(&frame).expect("decode should succeed")
        else {
            panic!("expected MessageResult");
        };
        prop_assert_eq!(result.temp_message_id, Some(temp));
        prop_assert_eq!(result.message_id, Some(MessageId::new(id)));
    }

    /// Arbitrary text never causes a panic when decoded as an event.
    #[test]
    fn random_text_decode_event_no_panic(frame in ".{0,512}") {
        let _ = codec::decode_event(&frame);
    }

    /// Arbitrary text never causes a panic when decoded as a command.
    #[test]
    fn random_text_decode_command_no_panic(frame in ".{0,512}") {
        let _ = codec::decode_command(&frame);
    }
}
