// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end chat flows over a real socket.
//!
//! Each test starts the server in-process on `127.0.0.1:0` with an
//! in-memory store and static tokens, then drives it with `ChatClient`s.
//! Covers offline send and history replay, read receipts, validation,
//! self-chat rejection, ordering with pagination and multi-device fan-out.

use std::sync::Arc;
use std::time::Duration;

use murmur::client::{ChatClient, ClientOptions, ClientUpdate};
use murmur::controller::{ChatController, Delivery};
use murmur::error::ClientError;
use murmur_proto::event::{ErrorCode, ServerEvent};
use murmur_proto::message::{HistoryCursor, UserId, UserProfile};
use murmur_server::engine::{ChatEngine, EngineConfig};
use murmur_server::gateway::{self, GatewayConfig, GatewayState};
use murmur_server::identity::StaticVerifier;
use murmur_server::presence::PresenceRegistry;
use murmur_server::store::InMemoryStore;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestState = GatewayState<InMemoryStore, StaticVerifier>;

fn uid(s: &str) -> UserId {
    UserId::new(s)
}

/// Start a server knowing alice, bob and carol (`t-<name>` tokens).
async fn start_server(engine_config: EngineConfig) -> (String, Arc<TestState>) {
    let verifier = ["alice", "bob", "carol"]
        .into_iter()
        .fold(StaticVerifier::new(), |v, name| {
            v.with_token(format!("t-{name}"), UserProfile::new(uid(name), name))
        });
    let store = InMemoryStore::with_users(verifier.profiles().cloned());
    let engine = ChatEngine::new(
        Arc::new(store),
        Arc::new(PresenceRegistry::new()),
        engine_config,
    );
    let state = Arc::new(GatewayState::new(
        engine,
        verifier,
        GatewayConfig::default(),
    ));
    let (addr, _handle) = gateway::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (format!("ws://{addr}/ws"), state)
}

async fn connect(url: &str, name: &str) -> ChatClient {
    ChatClient::connect(ClientOptions::new(url, format!("t-{name}")))
        .await
        .expect("connect failed")
}

/// Wait for a pushed event matching `pred`.
async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<ClientUpdate>,
    description: &str,
    pred: F,
) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(ClientUpdate::Event(event))) if pred(&event) => return event,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("update channel failed waiting for {description}: {e}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

/// Assert no event matching `pred` arrives within `window`.
async fn assert_no_event<F>(rx: &mut broadcast::Receiver<ClientUpdate>, window: Duration, pred: F)
where
    F: Fn(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(ClientUpdate::Event(event))) => {
                assert!(!pred(&event), "unexpected event {event:?}");
            }
            Ok(Ok(ClientUpdate::Status(_))) => {}
            Ok(Err(_)) | Err(_) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_send_appears_unread_in_history() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;

    // Bob is offline.
    let sent = alice.send_message(&uid("bob"), "hi").await.unwrap();
    assert_eq!(sent.sender_id, uid("alice"));
    assert_eq!(sent.receiver_id, uid("bob"));
    assert!(sent.created_at.as_millis() > 0);

    let bob = connect(&url, "bob").await;
    let joined = bob.join_chat(&uid("alice")).await.unwrap();
    assert_eq!(joined.history.peer_id, uid("alice"));
    assert_eq!(joined.history.messages.len(), 1);
    assert_eq!(joined.history.messages[0].id, sent.id);
    assert!(!joined.history.messages[0].read);

    assert_eq!(joined.conversations.len(), 1);
    assert_eq!(joined.conversations[0].peer.id, uid("alice"));
    assert_eq!(joined.conversations[0].unread_count, 1);
}

#[tokio::test]
async fn mark_read_notifies_sender_once() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;
    let mut alice_updates = alice.subscribe();
    alice.send_message(&uid("bob"), "one").await.unwrap();
    alice.send_message(&uid("bob"), "two").await.unwrap();

    let bob = connect(&url, "bob").await;
    bob.join_chat(&uid("alice")).await.unwrap();
    assert_eq!(bob.mark_read(&uid("alice")).await.unwrap(), 2);

    let event = wait_for_event(&mut alice_updates, "messages_read", |e| {
        matches!(e, ServerEvent::MessagesRead { .. })
    })
    .await;
    assert_eq!(event, ServerEvent::MessagesRead { read_by: uid("bob") });

    // Nothing left unread: no-op, no second receipt.
    assert_eq!(bob.mark_read(&uid("alice")).await.unwrap(), 0);
    assert_no_event(&mut alice_updates, Duration::from_millis(300), |e| {
        matches!(e, ServerEvent::MessagesRead { .. })
    })
    .await;

    let history = bob.join_chat(&uid("alice")).await.unwrap().history;
    assert!(history.messages.iter().all(|m| m.read));
}

#[tokio::test]
async fn whitespace_message_is_rejected() {
    let (url, state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;

    let err = alice.send_message(&uid("bob"), "   ").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidInput));
    assert!(!err.is_retryable());
    assert_eq!(state.engine().store().message_count().await, 0);

    let history = alice.join_chat(&uid("bob")).await.unwrap().history;
    assert!(history.messages.is_empty());
}

#[tokio::test]
async fn self_chat_is_rejected() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;

    let err = alice.join_chat(&uid("alice")).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotAuthorized));
    let err = alice.send_message(&uid("alice"), "me").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotAuthorized));
}

#[tokio::test]
async fn unknown_peer_is_not_found() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;

    let err = alice.join_chat(&uid("nobody")).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn history_is_ordered_and_pages_backwards() {
    let config = EngineConfig {
        page_size: 4,
        ..EngineConfig::default()
    };
    let (url, _state) = start_server(config).await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;

    for i in 0..10 {
        let (from, to) = if i % 2 == 0 {
            (&alice, uid("bob"))
        } else {
            (&bob, uid("alice"))
        };
        from.send_message(&to, &format!("m{i}")).await.unwrap();
    }

    let first = bob.join_chat(&uid("alice")).await.unwrap().history;
    let contents: Vec<_> = first.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["m6", "m7", "m8", "m9"]);
    assert!(first.has_more);

    let mut all = first.messages;
    let mut has_more = first.has_more;
    while has_more {
        let page = bob
            .load_more(HistoryCursor::BeforeMessageId(all[0].id))
            .await
            .unwrap();
        has_more = page.has_more;
        let mut older = page.messages;
        older.append(&mut all);
        all = older;
    }

    let contents: Vec<_> = all.iter().map(|m| m.content.clone()).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(contents, expected);
    assert!(
        all.windows(2)
            .all(|w| w[0].created_at <= w[1].created_at)
    );
}

#[tokio::test]
async fn load_more_without_open_conversation_is_not_found() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;

    let err = alice
        .load_more(HistoryCursor::BeforeTimestamp(
            murmur_proto::message::Timestamp::now(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn new_message_reaches_every_receiver_session() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;
    let bob_phone = connect(&url, "bob").await;
    let bob_laptop = connect(&url, "bob").await;
    let mut phone_updates = bob_phone.subscribe();
    let mut laptop_updates = bob_laptop.subscribe();

    let sent = alice.send_message(&uid("bob"), "ping").await.unwrap();

    for rx in [&mut phone_updates, &mut laptop_updates] {
        let event = wait_for_event(rx, "new_message", |e| {
            matches!(e, ServerEvent::NewMessage { .. })
        })
        .await;
        assert_eq!(event, ServerEvent::NewMessage { message: sent.clone() });
    }
}

#[tokio::test]
async fn conversations_are_most_recent_first() {
    let (url, _state) = start_server(EngineConfig::default()).await;
    let alice = connect(&url, "alice").await;
    alice.send_message(&uid("bob"), "to bob").await.unwrap();
    alice.send_message(&uid("carol"), "to carol").await.unwrap();

    let conversations = alice.get_conversations().await.unwrap();
    let peers: Vec<_> = conversations.iter().map(|c| c.peer.id.clone()).collect();
    assert_eq!(peers, [uid("carol"), uid("bob")]);
    assert!(conversations.iter().all(|c| c.unread_count == 0));
}

#[tokio::test]
async fn controllers_converse_end_to_end() {
    let (url, _state) = start_server(EngineConfig::default()).await;

    let alice_client = connect(&url, "alice").await;
    let alice_updates = alice_client.subscribe();
    let alice = Arc::new(ChatController::new(alice_client, uid("alice")));
    tokio::spawn(Arc::clone(&alice).run_updates(alice_updates));

    let bob_client = connect(&url, "bob").await;
    let bob_updates = bob_client.subscribe();
    let bob = Arc::new(ChatController::new(bob_client, uid("bob")));
    tokio::spawn(Arc::clone(&bob).run_updates(bob_updates));

    alice.join_chat(&uid("bob")).await.unwrap();
    bob.join_chat(&uid("alice")).await.unwrap();

    let sent = alice.send_message("hello bob").await.unwrap();
    let mine = alice.messages();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].delivery, Delivery::Confirmed);
    assert_eq!(mine[0].message.id, sent.id);

    // Bob's view picks the push up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bob.messages().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "bob never saw the message");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(bob.messages()[0].message.content, "hello bob");

    assert_eq!(bob.mark_as_read().await.unwrap(), 1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !alice.messages()[0].message.read {
        assert!(tokio::time::Instant::now() < deadline, "read receipt never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Terminal failure: the optimistic entry is rolled back.
    let err = alice.send_message(" \n ").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Server {
            code: ErrorCode::InvalidInput,
            ..
        }
    ));
    assert_eq!(alice.messages().len(), 1);
}
