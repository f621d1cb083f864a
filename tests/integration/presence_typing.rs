// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Presence registration and typing indicators over a real socket.
//!
//! Verifies:
//! 1. Typing start/stop reach the receiver; a forgotten stop expires.
//! 2. Disconnecting clears presence and any live typing indicator.
//! 3. A user who was offline catches up through history, not live fan-out.

use std::sync::Arc;
use std::time::Duration;

use murmur::client::{ChatClient, ClientOptions, ClientUpdate};
use murmur_proto::event::ServerEvent;
use murmur_proto::message::{UserId, UserProfile};
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

const TYPING_TIMEOUT: Duration = Duration::from_millis(300);

fn uid(s: &str) -> UserId {
    UserId::new(s)
}

async fn start_server() -> (String, Arc<TestState>) {
    let verifier = StaticVerifier::new()
        .with_token("t-alice", UserProfile::new(uid("alice"), "Alice"))
        .with_token("t-bob", UserProfile::new(uid("bob"), "Bob"));
    let store = InMemoryStore::with_users(verifier.profiles().cloned());
    let engine = ChatEngine::new(
        Arc::new(store),
        Arc::new(PresenceRegistry::new()),
        EngineConfig {
            typing_timeout: TYPING_TIMEOUT,
            ..EngineConfig::default()
        },
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

/// Next `user_typing` push, with the time it took to arrive.
async fn next_typing(rx: &mut broadcast::Receiver<ClientUpdate>) -> (UserId, bool, Duration) {
    let started = tokio::time::Instant::now();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for user_typing")
            .expect("update channel closed");
        if let ClientUpdate::Event(ServerEvent::UserTyping { user_id, is_typing }) = update {
            return (user_id, is_typing, started.elapsed());
        }
    }
}

async fn wait_until<F: Fn() -> bool>(description: &str, pred: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout waiting for {description}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_start_and_stop_reach_receiver() {
    let (url, _state) = start_server().await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;
    let mut bob_updates = bob.subscribe();

    alice.typing_start(&uid("bob")).await.unwrap();
    let (who, typing, _) = next_typing(&mut bob_updates).await;
    assert_eq!((who, typing), (uid("alice"), true));

    alice.typing_stop(&uid("bob")).await.unwrap();
    let (who, typing, _) = next_typing(&mut bob_updates).await;
    assert_eq!((who, typing), (uid("alice"), false));
}

#[tokio::test]
async fn forgotten_typing_expires() {
    let (url, _state) = start_server().await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;
    let mut bob_updates = bob.subscribe();

    alice.typing_start(&uid("bob")).await.unwrap();
    let (_, typing, _) = next_typing(&mut bob_updates).await;
    assert!(typing);

    // No typing_stop: the server clears it on its own.
    let (who, typing, waited) = next_typing(&mut bob_updates).await;
    assert_eq!((who, typing), (uid("alice"), false));
    assert!(waited >= TYPING_TIMEOUT / 2, "expired too early: {waited:?}");
}

#[tokio::test]
async fn repeated_typing_start_extends_the_window() {
    let (url, _state) = start_server().await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;
    let mut bob_updates = bob.subscribe();

    alice.typing_start(&uid("bob")).await.unwrap();
    assert!(next_typing(&mut bob_updates).await.1);
    tokio::time::sleep(TYPING_TIMEOUT / 2).await;
    alice.typing_start(&uid("bob")).await.unwrap();
    assert!(next_typing(&mut bob_updates).await.1);

    let (_, typing, waited) = next_typing(&mut bob_updates).await;
    assert!(!typing);
    assert!(waited >= TYPING_TIMEOUT / 2);
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_clears_presence_and_typing() {
    let (url, state) = start_server().await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;
    let mut bob_updates = bob.subscribe();

    let presence = Arc::clone(state.engine().presence());
    assert!(presence.is_online(&uid("alice")));

    alice.typing_start(&uid("bob")).await.unwrap();
    assert!(next_typing(&mut bob_updates).await.1);

    alice.shutdown().await;

    // The stop arrives from disconnect cleanup, well before the timer.
    let (who, typing, _) = next_typing(&mut bob_updates).await;
    assert_eq!((who, typing), (uid("alice"), false));
    wait_until("alice offline", || !presence.is_online(&uid("alice"))).await;
    assert_eq!(presence.session_count(&uid("alice")), 0);
    assert!(presence.is_online(&uid("bob")));
}

#[tokio::test]
async fn offline_user_catches_up_through_history() {
    let (url, state) = start_server().await;
    let presence = Arc::clone(state.engine().presence());

    let bob = connect(&url, "bob").await;
    bob.shutdown().await;
    wait_until("bob offline", || !presence.is_online(&uid("bob"))).await;

    // Delivery to zero sessions is not an error.
    let alice = connect(&url, "alice").await;
    let sent = alice.send_message(&uid("bob"), "while you were out").await.unwrap();

    let bob = connect(&url, "bob").await;
    let history = bob.join_chat(&uid("alice")).await.unwrap().history;
    assert_eq!(history.messages.len(), 1);
    assert_eq!(history.messages[0].id, sent.id);
    assert!(!history.messages[0].read);
}

#[tokio::test]
async fn one_device_leaving_keeps_user_online() {
    let (url, state) = start_server().await;
    let presence = Arc::clone(state.engine().presence());

    let phone = connect(&url, "bob").await;
    let laptop = connect(&url, "bob").await;
    let mut laptop_updates = laptop.subscribe();
    assert_eq!(presence.session_count(&uid("bob")), 2);

    phone.shutdown().await;
    wait_until("phone session gone", || presence.session_count(&uid("bob")) == 1).await;
    assert!(presence.is_online(&uid("bob")));

    let alice = connect(&url, "alice").await;
    alice.send_message(&uid("bob"), "still there?").await.unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientUpdate::Event(ServerEvent::NewMessage { message })) =
                laptop_updates.recv().await
            {
                return message;
            }
        }
    })
    .await
    .expect("laptop never received the message");
    assert_eq!(update.content, "still there?");
}
