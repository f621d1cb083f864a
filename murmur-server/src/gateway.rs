//! WebSocket gateway: shared state, upgrade handler, per-connection loop.
//!
//! Each connection is authenticated before anything else happens. On
//! success the engine opens a [`Session`]; a writer task drains the
//! session's bounded outbound queue to the socket and pings on a fixed
//! interval, while the reader loop feeds inbound frames to the engine one
//! at a time. Whichever side stops first ends the connection, and
//! disconnect cleanup always runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_proto::codec;
use murmur_proto::event::{ErrorCode, ServerEvent, ServerFrame};
use murmur_proto::message::UserProfile;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::engine::ChatEngine;
use crate::identity::{AuthError, Credential, IdentityVerifier, extract_credential};
use crate::session::Session;
use crate::store::MessageStore;

/// Default authentication window.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default server ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default capacity of each session's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Consecutive unanswered pings before the connection is dropped.
const MAX_MISSED_PONGS: u8 = 2;

/// How long the writer may keep flushing after the reader has stopped.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection-level tunables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for credential verification.
    pub auth_timeout: Duration,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Capacity of each session's outbound queue.
    pub outbound_queue_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

/// Shared gateway state: the engine, the verifier and a shutdown signal.
pub struct GatewayState<S, V> {
    engine: ChatEngine<S>,
    verifier: V,
    config: GatewayConfig,
    shutdown: watch::Sender<bool>,
}

impl<S, V> GatewayState<S, V>
where
    S: MessageStore + 'static,
    V: IdentityVerifier + 'static,
{
    /// Bundles the engine and verifier for the router.
    #[must_use]
    pub fn new(engine: ChatEngine<S>, verifier: V, config: GatewayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            verifier,
            config,
            shutdown,
        }
    }

    /// The chat engine.
    #[must_use]
    pub const fn engine(&self) -> &ChatEngine<S> {
        &self.engine
    }

    /// Closes every open connection. Clients see a normal close and run
    /// their reconnect policy; the listener keeps accepting.
    pub fn close_all_connections(&self) {
        tracing::info!("closing all connections");
        self.shutdown.send_modify(|closed| *closed = !*closed);
    }

    async fn authenticate(&self, credential: Option<Credential>) -> Result<UserProfile, AuthError> {
        let credential = credential.ok_or(AuthError::Missing)?;
        tokio::time::timeout(self.config.auth_timeout, self.verifier.verify(&credential))
            .await
            .unwrap_or(Err(AuthError::Timeout))
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Verify the credential; on failure send `error{NotAuthenticated}` and close.
/// 2. Open a session (registers presence, queues `connected`).
/// 3. Run the writer task and the reader loop until either stops.
/// 4. Run disconnect cleanup, then let the writer flush briefly.
pub async fn handle_socket<S, V>(
    socket: WebSocket,
    state: Arc<GatewayState<S, V>>,
    credential: Option<Credential>,
) where
    S: MessageStore + 'static,
    V: IdentityVerifier + 'static,
{
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let profile = match state.authenticate(credential).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!(error = %e, "authentication failed");
            reject(&mut ws_sender, ErrorCode::NotAuthenticated, &e.to_string()).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(state.config.outbound_queue_size);
    let mut session = match state.engine.connect(profile, tx).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to open session");
            reject(&mut ws_sender, ErrorCode::InternalError, "internal error").await;
            return;
        }
    };

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut write_task = spawn_writer(
        ws_sender,
        rx,
        state.config.heartbeat_interval,
        Arc::clone(&pong_received),
        session.id().to_string(),
    );

    let mut shutdown = state.shutdown.subscribe();
    let eviction = session.eviction();
    let (user_id, session_id) = (session.user_id().clone(), session.id());
    let reader_stopped = tokio::select! {
        () = read_loop(&mut ws_receiver, &state.engine, &mut session, &pong_received) => true,
        _ = shutdown.changed() => true,
        () = eviction.notified() => {
            tracing::warn!(user_id = %user_id, session_id = %session_id, "closing lagging session");
            true
        }
        _ = &mut write_task => false,
    };

    state.engine.disconnect(&mut session);
    drop(session);

    if reader_stopped && tokio::time::timeout(FLUSH_TIMEOUT, &mut write_task).await.is_err() {
        write_task.abort();
    }
}

/// Sends a final error frame followed by a policy close.
async fn reject(sink: &mut SplitSink<WebSocket, Message>, code: ErrorCode, message: &str) {
    let frame = ServerFrame::push(ServerEvent::error(code, message));
    if let Ok(text) = codec::encode_server(&frame) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: code.to_string().into(),
        })))
        .await;
}

/// Reads inbound frames serially until the peer closes or errors.
async fn read_loop<S: MessageStore + 'static>(
    receiver: &mut SplitStream<WebSocket>,
    engine: &ChatEngine<S>,
    session: &mut Session,
    pong_received: &AtomicBool,
) {
    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(session_id = %session.id(), error = %e, "socket read failed");
                break;
            }
        };
        match msg {
            Message::Text(text) => match codec::decode_client(text.as_str()) {
                Ok(frame) => engine.dispatch(session, frame).await,
                Err(e) => {
                    tracing::warn!(
                        user_id = %session.user_id(),
                        error = %e,
                        "rejecting malformed frame"
                    );
                    let reply = ServerFrame {
                        reply_to: codec::recover_request_id(text.as_str()),
                        event: ServerEvent::error(ErrorCode::InvalidInput, e.to_string()),
                    };
                    session.send(reply).await;
                }
            },
            Message::Binary(_) => {
                let reply = ServerFrame::push(ServerEvent::error(
                    ErrorCode::InvalidInput,
                    "binary frames are not supported",
                ));
                session.send(reply).await;
            }
            Message::Pong(_) => pong_received.store(true, Ordering::Release),
            Message::Close(_) => {
                tracing::debug!(session_id = %session.id(), "received close frame");
                break;
            }
            Message::Ping(_) => {}
        }
    }
}

/// Spawns the task that drains the outbound queue to the socket and keeps
/// the heartbeat.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
    heartbeat_interval: Duration,
    pong_received: Arc<AtomicBool>,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed: u8 = 0;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match codec::encode_server(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        tracing::debug!(session_id = %session_id, "socket write failed");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_received.swap(false, Ordering::AcqRel) {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= MAX_MISSED_PONGS {
                            tracing::warn!(session_id = %session_id, missed, "heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// axum handler that captures the credential and upgrades the connection.
async fn ws_handler<S, V>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<S, V>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> impl IntoResponse
where
    S: MessageStore + 'static,
    V: IdentityVerifier + 'static,
{
    let credential = extract_credential(&headers, query.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, credential))
}

async fn health() -> &'static str {
    "ok"
}

/// Builds the router: `GET /ws` and `GET /health`.
pub fn router<S, V>(state: Arc<GatewayState<S, V>>) -> axum::Router
where
    S: MessageStore + 'static,
    V: IdentityVerifier + 'static,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S, V>))
        .route("/health", axum::routing::get(health))
        .with_state(state)
}

/// Starts the server on `addr` and returns the bound address and a join
/// handle.
///
/// This is the entry point used by both `main.rs` and tests; bind to
/// `127.0.0.1:0` for an OS-assigned port.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S, V>(
    addr: &str,
    state: Arc<GatewayState<S, V>>,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>>
where
    S: MessageStore + 'static,
    V: IdentityVerifier + 'static,
{
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
