//! Request/response client with push subscription and reconnection.
//!
//! [`ChatClient`] is a cheap handle onto a supervisor task that owns the
//! WebSocket. Each request gets a fresh frame id; the supervisor matches
//! `replyTo` frames back to the waiting caller and forwards unsolicited
//! pushes to every [`ChatClient::subscribe`]r as [`ClientUpdate`]s.
//!
//! # Reconnection
//!
//! When the transport drops, in-flight requests fail with
//! [`ClientError::Disconnected`] and the supervisor retries with
//! exponential backoff and jitter, up to [`ReconnectConfig::max_attempts`].
//! While it is down, `send_message` fails fast and other requests are
//! queued (up to [`ReconnectConfig::queue_limit`]). After reconnecting it
//! first replays `join_chat` for the conversation that was open, publishing
//! the resulting history as updates, then flushes the queue in order.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use murmur_proto::codec;
use murmur_proto::event::{ClientEvent, ClientFrame, ServerEvent};
use murmur_proto::message::{
    ChatMessage, ConversationSummary, HistoryCursor, UserId, UserProfile,
};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{self, Connection, WsReader, WsSender};
use crate::error::ClientError;

/// Capacity of the push update channel.
const UPDATE_BUFFER: usize = 256;

/// Capacity of the command channel into the supervisor.
const COMMAND_BUFFER: usize = 64;

/// How often in-flight requests are checked against their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff policy for re-establishing a lost connection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Attempts before giving up and reporting `Disconnected`.
    pub max_attempts: u32,
    /// Requests held while disconnected.
    pub queue_limit: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
            queue_limit: 64,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }

    /// Backoff before `attempt` with up to 20% random jitter added.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::rng().random_range(0.0..=0.2);
        base.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

/// Everything needed to (re)establish a session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:9000/ws`.
    pub url: String,
    /// Credential sent as a bearer token.
    pub token: String,
    /// Bound on connect and on waiting for each reply.
    pub request_timeout: Duration,
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
}

impl ClientOptions {
    /// Options with default timeouts and backoff.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// State of the client's link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Authenticated and serving requests.
    Connected,
    /// Transport lost; running reconnect attempt `attempt`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Gave up (or shut down). Requests fail until [`ChatClient::reconnect`].
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Something subscribers should apply to their view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    /// The connection status changed.
    Status(ConnectionStatus),
    /// A server push, or a reply to a request the client replayed itself.
    Event(ServerEvent),
}

/// One page of a conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// The counterpart.
    pub peer_id: UserId,
    /// Messages in chronological order.
    pub messages: Vec<ChatMessage>,
    /// Whether older messages exist.
    pub has_more: bool,
}

/// Result of `join_chat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChat {
    /// Latest page of the conversation.
    pub history: HistoryPage,
    /// The caller's conversation list.
    pub conversations: Vec<ConversationSummary>,
}

type ReplySender = oneshot::Sender<Result<Vec<ServerEvent>, ClientError>>;

struct Request {
    event: ClientEvent,
    reply: ReplySender,
}

enum Command {
    Request(Request),
    Reconnect,
    Shutdown,
}

/// Handle to a connected client. Clones share the same connection.
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    updates: broadcast::Sender<ClientUpdate>,
    user: UserProfile,
}

impl ChatClient {
    /// Connect and authenticate, then start the supervisor.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure; no retry happens here.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let conn = connection::open(&options.url, &options.token, options.request_timeout).await?;
        let user = conn.user.clone();

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connected);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let supervisor = Supervisor {
            options,
            commands: command_rx,
            status: status_tx,
            updates: updates.clone(),
            next_id: 1,
            in_flight: HashMap::new(),
            queued: VecDeque::new(),
            current_peer: None,
        };
        tokio::spawn(supervisor.run(conn));

        Ok(Self {
            commands,
            status,
            updates,
            user,
        })
    }

    /// The identity the server authenticated.
    #[must_use]
    pub const fn user(&self) -> &UserProfile {
        &self.user
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// A watch on the connection status.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Subscribe to pushes and status changes from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    /// Send `event` and wait for every reply frame it produces.
    ///
    /// # Errors
    ///
    /// [`ClientError::Server`] when the server answers with `error`;
    /// [`ClientError::Disconnected`] or [`ClientError::Timeout`] when no
    /// answer can arrive.
    pub async fn request(&self, event: ClientEvent) -> Result<Vec<ServerEvent>, ClientError> {
        if matches!(event, ClientEvent::SendMessage { .. })
            && self.status() != ConnectionStatus::Connected
        {
            return Err(ClientError::Disconnected);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request(Request { event, reply }))
            .await
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Open the conversation with `peer`.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn join_chat(&self, peer: &UserId) -> Result<JoinedChat, ClientError> {
        let replies = self
            .request(ClientEvent::JoinChat {
                other_user_id: peer.clone(),
            })
            .await?;
        let mut history = None;
        let mut conversations = None;
        for event in replies {
            match event {
                ServerEvent::ChatHistory {
                    peer_id,
                    messages,
                    has_more,
                } => {
                    history = Some(HistoryPage {
                        peer_id,
                        messages,
                        has_more,
                    });
                }
                ServerEvent::Conversations { conversations: list } => conversations = Some(list),
                other => return Err(ClientError::UnexpectedReply(other.name())),
            }
        }
        match (history, conversations) {
            (Some(history), Some(conversations)) => Ok(JoinedChat {
                history,
                conversations,
            }),
            _ => Err(ClientError::UnexpectedReply("incomplete join_chat reply")),
        }
    }

    /// Close the open conversation.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn leave_chat(&self) -> Result<(), ClientError> {
        expect_ack(self.request(ClientEvent::LeaveChat {}).await?)
    }

    /// Send `content` to `receiver`; returns the stored message.
    ///
    /// # Errors
    ///
    /// Fails fast with [`ClientError::Disconnected`] while not connected.
    pub async fn send_message(
        &self,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, ClientError> {
        let event = ClientEvent::SendMessage {
            receiver_id: receiver.clone(),
            content: content.to_string(),
        };
        match single(self.request(event).await?)? {
            ServerEvent::MessageSent { message } => Ok(message),
            other => Err(ClientError::UnexpectedReply(other.name())),
        }
    }

    /// Tell `receiver` the caller started typing.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn typing_start(&self, receiver: &UserId) -> Result<(), ClientError> {
        expect_ack(
            self.request(ClientEvent::TypingStart {
                receiver_id: receiver.clone(),
            })
            .await?,
        )
    }

    /// Tell `receiver` the caller stopped typing.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn typing_stop(&self, receiver: &UserId) -> Result<(), ClientError> {
        expect_ack(
            self.request(ClientEvent::TypingStop {
                receiver_id: receiver.clone(),
            })
            .await?,
        )
    }

    /// Mark everything `sender` sent the caller as read; returns how many
    /// messages changed.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn mark_read(&self, sender: &UserId) -> Result<u64, ClientError> {
        let event = ClientEvent::MarkRead {
            sender_id: sender.clone(),
        };
        match single(self.request(event).await?)? {
            ServerEvent::ReadMarked { updated, .. } => Ok(updated),
            other => Err(ClientError::UnexpectedReply(other.name())),
        }
    }

    /// Fetch the caller's conversation list.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn get_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        match single(self.request(ClientEvent::GetConversations {}).await?)? {
            ServerEvent::Conversations { conversations } => Ok(conversations),
            other => Err(ClientError::UnexpectedReply(other.name())),
        }
    }

    /// Fetch the page before `cursor` in the open conversation.
    ///
    /// # Errors
    ///
    /// See [`ChatClient::request`].
    pub async fn load_more(&self, cursor: HistoryCursor) -> Result<HistoryPage, ClientError> {
        match single(self.request(ClientEvent::LoadMore { cursor }).await?)? {
            ServerEvent::ChatHistory {
                peer_id,
                messages,
                has_more,
            } => Ok(HistoryPage {
                peer_id,
                messages,
                has_more,
            }),
            other => Err(ClientError::UnexpectedReply(other.name())),
        }
    }

    /// Restart reconnect attempts after the budget ran out.
    pub async fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect).await;
    }

    /// Close the connection and stop the supervisor.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

fn single(replies: Vec<ServerEvent>) -> Result<ServerEvent, ClientError> {
    replies
        .into_iter()
        .next()
        .ok_or(ClientError::UnexpectedReply("empty reply"))
}

fn expect_ack(replies: Vec<ServerEvent>) -> Result<(), ClientError> {
    match single(replies)? {
        ServerEvent::Ack {} => Ok(()),
        other => Err(ClientError::UnexpectedReply(other.name())),
    }
}

/// Reply frames the server sends for `event`.
const fn expected_replies(event: &ClientEvent) -> usize {
    match event {
        ClientEvent::JoinChat { .. } => 2,
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct InFlight {
    event: ClientEvent,
    replies: Vec<ServerEvent>,
    deadline: Instant,
    /// `None` for requests the supervisor issued itself.
    reply: Option<ReplySender>,
}

enum Outcome {
    Lost,
    Shutdown,
}

struct Supervisor {
    options: ClientOptions,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    updates: broadcast::Sender<ClientUpdate>,
    next_id: u64,
    in_flight: HashMap<u64, InFlight>,
    queued: VecDeque<Request>,
    /// Peer of the last successful `join_chat`, replayed after reconnect.
    current_peer: Option<UserId>,
}

impl Supervisor {
    async fn run(mut self, first: Connection) {
        let mut conn = first;
        loop {
            let outcome = self.serve(conn).await;
            self.fail_in_flight();
            if matches!(outcome, Outcome::Shutdown) {
                break;
            }
            tracing::warn!("connection lost, reconnecting");
            match self.reconnect().await {
                Some(next) => conn = next,
                None => break,
            }
        }
        self.drain_queue();
        self.set_status(ConnectionStatus::Disconnected);
        tracing::info!("client supervisor exiting");
    }

    async fn serve(&mut self, conn: Connection) -> Outcome {
        let Connection {
            mut sender,
            mut reader,
            user,
        } = conn;
        self.set_status(ConnectionStatus::Connected);
        tracing::debug!(user_id = %user.id, queued = self.queued.len(), "session established");

        if let Some(peer) = self.current_peer.clone() {
            let replay = ClientEvent::JoinChat {
                other_user_id: peer,
            };
            if self.dispatch(&mut sender, replay, None).await.is_err() {
                return Outcome::Lost;
            }
        }
        while let Some(request) = self.queued.pop_front() {
            if request.reply.is_closed() {
                continue;
            }
            if self
                .dispatch(&mut sender, request.event, Some(request.reply))
                .await
                .is_err()
            {
                return Outcome::Lost;
            }
        }

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Request(request)) => {
                        if self
                            .dispatch(&mut sender, request.event, Some(request.reply))
                            .await
                            .is_err()
                        {
                            return Outcome::Lost;
                        }
                    }
                    Some(Command::Reconnect) => {}
                    Some(Command::Shutdown) | None => {
                        let _ = sender.send(Message::Close(None)).await;
                        return Outcome::Shutdown;
                    }
                },
                lost = read_frame(&mut reader) => match lost {
                    Some(text) => self.handle_text(&text),
                    None => return Outcome::Lost,
                },
                _ = sweep.tick() => self.expire(),
            }
        }
    }

    /// Encode and write one request. An `Err` means the transport is gone.
    async fn dispatch(
        &mut self,
        sender: &mut WsSender,
        event: ClientEvent,
        reply: Option<ReplySender>,
    ) -> Result<(), ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let text = match codec::encode_client(&ClientFrame {
            id,
            event: event.clone(),
        }) {
            Ok(text) => text,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return Ok(());
            }
        };

        tracing::debug!(id, event = event.name(), "sending request");
        self.in_flight.insert(
            id,
            InFlight {
                event,
                replies: Vec::new(),
                deadline: Instant::now() + self.options.request_timeout,
                reply,
            },
        );
        sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "WebSocket send failed");
                ClientError::Transport(e.to_string())
            })
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match codec::decode_server(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "malformed server frame, skipping");
                return;
            }
        };
        match frame.reply_to {
            None => self.publish(ClientUpdate::Event(frame.event)),
            Some(id) => self.resolve(id, frame.event),
        }
    }

    fn resolve(&mut self, id: u64, event: ServerEvent) {
        let Some(entry) = self.in_flight.get_mut(&id) else {
            tracing::debug!(id, event = event.name(), "reply for unknown request");
            return;
        };
        if let ServerEvent::Error { code, message } = event {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.complete(entry, Err(ClientError::Server { code, message }));
            }
            return;
        }
        entry.replies.push(event);
        if entry.replies.len() >= expected_replies(&entry.event)
            && let Some(mut entry) = self.in_flight.remove(&id)
        {
            self.track(&entry.event);
            let replies = std::mem::take(&mut entry.replies);
            self.complete(entry, Ok(replies));
        }
    }

    fn complete(&self, entry: InFlight, result: Result<Vec<ServerEvent>, ClientError>) {
        match (entry.reply, result) {
            (Some(reply), result) => {
                let _ = reply.send(result);
            }
            (None, Ok(replies)) => {
                for event in replies {
                    self.publish(ClientUpdate::Event(event));
                }
            }
            (None, Err(e)) => {
                tracing::warn!(event = entry.event.name(), err = %e, "replayed request failed");
            }
        }
    }

    /// Remember the open conversation so it can be replayed.
    fn track(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::JoinChat { other_user_id } => {
                self.current_peer = Some(other_user_id.clone());
            }
            ClientEvent::LeaveChat {} => self.current_peer = None,
            _ => {}
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                tracing::warn!(id, event = entry.event.name(), "request timed out");
                self.complete(entry, Err(ClientError::Timeout));
            }
        }
    }

    fn fail_in_flight(&mut self) {
        for (_, entry) in std::mem::take(&mut self.in_flight) {
            self.complete(entry, Err(ClientError::Disconnected));
        }
    }

    fn drain_queue(&mut self) {
        for request in self.queued.drain(..) {
            let _ = request.reply.send(Err(ClientError::Disconnected));
        }
    }

    /// Hold a request until the connection is back.
    fn enqueue(&mut self, request: Request) {
        if matches!(request.event, ClientEvent::SendMessage { .. })
            || self.queued.len() >= self.options.reconnect.queue_limit
        {
            let _ = request.reply.send(Err(ClientError::Disconnected));
            return;
        }
        self.queued.push_back(request);
    }

    /// Run the backoff schedule. `None` means the client shut down.
    async fn reconnect(&mut self) -> Option<Connection> {
        loop {
            for attempt in 1..=self.options.reconnect.max_attempts {
                self.set_status(ConnectionStatus::Reconnecting { attempt });
                let delay = self.options.reconnect.delay(attempt);
                if !self.wait(delay).await {
                    return None;
                }
                match connection::open(
                    &self.options.url,
                    &self.options.token,
                    self.options.request_timeout,
                )
                .await
                {
                    Ok(conn) => {
                        tracing::info!(attempt, "reconnected");
                        return Some(conn);
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(attempt, err = %e, "reconnect attempt failed");
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "reconnect rejected, giving up");
                        break;
                    }
                }
            }

            tracing::warn!("reconnect budget exhausted");
            self.set_status(ConnectionStatus::Disconnected);
            self.drain_queue();
            loop {
                match self.commands.recv().await {
                    Some(Command::Reconnect) => break,
                    Some(Command::Request(request)) => {
                        let _ = request.reply.send(Err(ClientError::Disconnected));
                    }
                    Some(Command::Shutdown) | None => return None,
                }
            }
        }
    }

    /// Sleep for `delay` while queueing requests. `false` means shut down.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Request(request)) => self.enqueue(request),
                    Some(Command::Reconnect) => return true,
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if *self.status.borrow() != status {
            self.status.send_replace(status);
            self.publish(ClientUpdate::Status(status));
        }
    }

    fn publish(&self, update: ClientUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

/// Next text frame, or `None` once the connection is gone.
async fn read_frame(reader: &mut WsReader) -> Option<String> {
    loop {
        match reader.next().await? {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "server closed the connection");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                return None;
            }
        }
    }
}
