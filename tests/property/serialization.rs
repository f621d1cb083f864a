//! Property-based tests for the Murmur wire protocol.
//!
//! Uses proptest to verify:
//! 1. Any client frame survives encode → decode.
//! 2. Any server push carrying a message survives encode → decode.
//! 3. Arbitrary text never panics the decoder.
//! 4. Content validation and conversation keys keep their invariants.

use murmur_proto::codec;
use murmur_proto::event::{ClientEvent, ClientFrame, ServerEvent, ServerFrame};
use murmur_proto::message::*;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[A-Za-z0-9_.@-]{1,64}".prop_map(UserId::new)
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn arb_cursor() -> impl Strategy<Value = HistoryCursor> {
    prop_oneof![
        arb_message_id().prop_map(HistoryCursor::BeforeMessageId),
        arb_timestamp().prop_map(HistoryCursor::BeforeTimestamp),
    ]
}

fn arb_client_event() -> impl Strategy<Value = ClientEvent> {
    prop_oneof![
        arb_user_id().prop_map(|other_user_id| ClientEvent::JoinChat { other_user_id }),
        Just(ClientEvent::LeaveChat {}),
        (arb_user_id(), ".{0,256}").prop_map(|(receiver_id, content)| {
            ClientEvent::SendMessage {
                receiver_id,
                content,
            }
        }),
        arb_user_id().prop_map(|receiver_id| ClientEvent::TypingStart { receiver_id }),
        arb_user_id().prop_map(|receiver_id| ClientEvent::TypingStop { receiver_id }),
        arb_user_id().prop_map(|sender_id| ClientEvent::MarkRead { sender_id }),
        Just(ClientEvent::GetConversations {}),
        arb_cursor().prop_map(|cursor| ClientEvent::LoadMore { cursor }),
    ]
}

fn arb_chat_message() -> impl Strategy<Value = ChatMessage> {
    (
        arb_message_id(),
        arb_user_id(),
        arb_user_id(),
        "[^\x00]{1,512}",
        arb_timestamp(),
        any::<bool>(),
    )
        .prop_map(
            |(id, sender_id, receiver_id, content, created_at, read)| ChatMessage {
                id,
                sender_id,
                receiver_id,
                content,
                created_at,
                read,
            },
        )
}

proptest! {
    #[test]
    fn client_frame_round_trip(id in any::<u64>(), event in arb_client_event()) {
        let frame = ClientFrame { id, event };
        let text = codec::encode_client(&frame).expect("encode should succeed");
        let decoded = codec::decode_client(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    #[test]
    fn new_message_push_round_trip(message in arb_chat_message()) {
        let frame = ServerFrame::push(ServerEvent::NewMessage { message });
        let text = codec::encode_server(&frame).expect("encode should succeed");
        let decoded = codec::decode_server(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Arbitrary text never panics the decoder or the id recovery.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode_client(&text);
        let _ = codec::decode_server(&text);
        let _ = codec::recover_request_id(&text);
    }

    /// Accepted content is trimmed, non-empty and within the limit.
    #[test]
    fn validated_content_is_trimmed_and_bounded(raw in "\\s{0,4}.{0,64}\\s{0,4}", max in 1usize..32) {
        match validate_content(&raw, max) {
            Ok(content) => {
                prop_assert!(!content.is_empty());
                prop_assert_eq!(content, content.trim());
                prop_assert!(content.chars().count() <= max);
            }
            Err(ValidationError::Empty) => prop_assert!(raw.trim().is_empty()),
            Err(ValidationError::TooLong { chars, .. }) => prop_assert!(chars > max),
            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
        }
    }

    #[test]
    fn conversation_key_is_symmetric(a in arb_user_id(), b in arb_user_id()) {
        let ab = ConversationKey::new(a.clone(), b.clone());
        let ba = ConversationKey::new(b.clone(), a.clone());
        prop_assert_eq!(&ab, &ba);
        prop_assert!(ab.contains(&a));
        prop_assert!(ab.contains(&b));
    }

    #[test]
    fn generated_user_ids_parse(id in arb_user_id()) {
        prop_assert!(UserId::parse(id.as_str()).is_ok());
    }
}
