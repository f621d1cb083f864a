// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Client reconnection policy against a real server.
//!
//! Tests that the client supervisor notices a lost connection, backs off,
//! reconnects, replays `join_chat` for the open conversation (delivering
//! history written while it was away), fails sends fast while down, holds
//! other requests until it is back, and reports `Disconnected` once the
//! attempt budget is spent.
//!
//! ## Disconnect simulation
//!
//! `GatewayState::close_all_connections` closes every socket while the
//! listener keeps accepting, so the client can come straight back. For
//! outages that must outlast several attempts, a TCP proxy sits between
//! client and server; killing it severs the connection and refuses new
//! ones until a fresh proxy is bound to the same port.

use std::sync::Arc;
use std::time::Duration;

use murmur::client::{ChatClient, ClientOptions, ClientUpdate, ConnectionStatus, ReconnectConfig};
use murmur::error::ClientError;
use murmur_proto::event::ServerEvent;
use murmur_proto::message::{UserId, UserProfile};
use murmur_server::engine::{ChatEngine, EngineConfig};
use murmur_server::gateway::{self, GatewayConfig, GatewayState};
use murmur_server::identity::StaticVerifier;
use murmur_server::presence::PresenceRegistry;
use murmur_server::store::{InMemoryStore, MessageStore};
use parking_lot::Mutex;
use tokio::sync::broadcast;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a local port to the server. `kill()` aborts the accept loop
/// and every proxied connection, tearing both directions down at once.
struct TcpProxy {
    port: u16,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(port: u16, backend: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {port}: {e}"));
        let port = listener.local_addr().unwrap().port();
        let backend = backend.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(handle);
            }
        });

        Self {
            port,
            accept_handle,
            conn_handles,
        }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    async fn kill(self) {
        self.accept_handle.abort();
        let _ = self.accept_handle.await;
        for handle in self.conn_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

type TestState = GatewayState<InMemoryStore, StaticVerifier>;

fn uid(s: &str) -> UserId {
    UserId::new(s)
}

/// Start the server; returns its `host:port` and state.
async fn start_server() -> (String, Arc<TestState>) {
    let verifier = StaticVerifier::new()
        .with_token("t-alice", UserProfile::new(uid("alice"), "Alice"))
        .with_token("t-bob", UserProfile::new(uid("bob"), "Bob"));
    let store = InMemoryStore::with_users(verifier.profiles().cloned());
    let engine = ChatEngine::new(
        Arc::new(store),
        Arc::new(PresenceRegistry::new()),
        EngineConfig::default(),
    );
    let state = Arc::new(GatewayState::new(
        engine,
        verifier,
        GatewayConfig::default(),
    ));
    let (addr, _handle) = gateway::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (addr.to_string(), state)
}

/// Fast backoff for tests.
fn options(url: &str, token: &str, max_attempts: u32) -> ClientOptions {
    ClientOptions {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts,
            queue_limit: 8,
        },
        request_timeout: Duration::from_secs(5),
        ..ClientOptions::new(url, token)
    }
}

async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ClientUpdate>,
    description: &str,
    pred: F,
) -> ClientUpdate
where
    F: Fn(&ClientUpdate) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(update)) if pred(&update) => return update,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("update channel failed waiting for {description}: {e}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

async fn wait_for_status(rx: &mut broadcast::Receiver<ClientUpdate>, status: ConnectionStatus) {
    wait_for(rx, &format!("status {status}"), |u| {
        *u == ClientUpdate::Status(status)
    })
    .await;
}

async fn wait_for_reconnecting(rx: &mut broadcast::Receiver<ClientUpdate>) {
    wait_for(rx, "reconnecting", |u| {
        matches!(
            u,
            ClientUpdate::Status(ConnectionStatus::Reconnecting { .. })
        )
    })
    .await;
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn reconnect_replays_open_conversation() {
    let (addr, state) = start_server().await;
    let url = format!("ws://{addr}/ws");
    let alice = ChatClient::connect(options(&url, "t-alice", 10)).await.unwrap();
    let mut updates = alice.subscribe();
    alice.join_chat(&uid("bob")).await.unwrap();

    state.close_all_connections();
    wait_for_reconnecting(&mut updates).await;

    // Written while alice is away; she must see it without asking.
    let missed = state
        .engine()
        .store()
        .create_message(&uid("bob"), &uid("alice"), "while you were away")
        .await
        .unwrap();

    wait_for_status(&mut updates, ConnectionStatus::Connected).await;
    let replay = wait_for(&mut updates, "replayed chat_history", |u| {
        matches!(u, ClientUpdate::Event(ServerEvent::ChatHistory { .. }))
    })
    .await;
    let ClientUpdate::Event(ServerEvent::ChatHistory {
        peer_id, messages, ..
    }) = replay
    else {
        unreachable!()
    };
    assert_eq!(peer_id, uid("bob"));
    assert!(messages.iter().any(|m| m.id == missed.id));

    // The session works normally afterwards.
    assert_eq!(alice.status(), ConnectionStatus::Connected);
    alice.send_message(&uid("bob"), "back").await.unwrap();
}

#[tokio::test]
async fn acked_message_survives_receiver_reconnect() {
    let (addr, state) = start_server().await;
    let url = format!("ws://{addr}/ws");
    let alice = ChatClient::connect(options(&url, "t-alice", 10)).await.unwrap();
    let bob = ChatClient::connect(options(&url, "t-bob", 10)).await.unwrap();
    let mut bob_updates = bob.subscribe();

    let sent = alice.send_message(&uid("bob"), "durable").await.unwrap();

    state.close_all_connections();
    wait_for_reconnecting(&mut bob_updates).await;
    wait_for_status(&mut bob_updates, ConnectionStatus::Connected).await;

    let history = bob.join_chat(&uid("alice")).await.unwrap().history;
    assert!(history.messages.iter().any(|m| m.id == sent.id));
}

#[tokio::test]
async fn send_fails_fast_and_other_requests_wait_for_reconnect() {
    let (backend, _state) = start_server().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let port = proxy.port;
    let url = proxy.url();

    let alice = ChatClient::connect(options(&url, "t-alice", 20)).await.unwrap();
    let mut updates = alice.subscribe();
    alice.send_message(&uid("bob"), "before").await.unwrap();

    proxy.kill().await;
    wait_for_reconnecting(&mut updates).await;

    let err = alice.send_message(&uid("bob"), "during").await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));
    assert!(err.is_retryable());

    // Queued until the connection is back.
    let queued = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.get_conversations().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!queued.is_finished());

    let proxy = TcpProxy::new(port, &backend).await;
    wait_for_status(&mut updates, ConnectionStatus::Connected).await;

    let conversations = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued request never completed")
        .unwrap()
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].last_message.content, "before");

    proxy.kill().await;
}

#[tokio::test]
async fn exhausted_budget_reports_disconnected_until_asked_again() {
    let (backend, _state) = start_server().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let port = proxy.port;
    let url = proxy.url();

    let alice = ChatClient::connect(options(&url, "t-alice", 2)).await.unwrap();
    let mut updates = alice.subscribe();

    proxy.kill().await;
    wait_for_status(&mut updates, ConnectionStatus::Disconnected).await;
    assert_eq!(alice.status(), ConnectionStatus::Disconnected);

    let err = alice.get_conversations().await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));

    let proxy = TcpProxy::new(port, &backend).await;
    alice.reconnect().await;
    wait_for_status(&mut updates, ConnectionStatus::Connected).await;
    assert!(alice.get_conversations().await.unwrap().is_empty());

    proxy.kill().await;
}

#[tokio::test]
async fn shutdown_during_reconnect_stops_cleanly() {
    let (backend, _state) = start_server().await;
    let proxy = TcpProxy::new(0, &backend).await;
    let url = proxy.url();

    let alice = ChatClient::connect(options(&url, "t-alice", 50)).await.unwrap();
    let mut updates = alice.subscribe();

    proxy.kill().await;
    wait_for_reconnecting(&mut updates).await;

    alice.shutdown().await;
    wait_for_status(&mut updates, ConnectionStatus::Disconnected).await;
    assert!(matches!(
        alice.get_conversations().await,
        Err(ClientError::Disconnected)
    ));
}
