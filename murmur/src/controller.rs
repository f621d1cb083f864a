//! UI-facing chat state.
//!
//! [`ChatController`] turns protocol calls into view state: the open
//! conversation's messages, the conversation list, the unread total, who is
//! typing and the connection status. Pushes from the server are folded in
//! through [`ChatController::apply_update`].
//!
//! `send_message` and `mark_as_read` update the view before the server
//! confirms. Each has an apply step, a confirm step and exactly one rollback
//! function that undoes the apply when the server refuses.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use murmur_proto::event::ServerEvent;
use murmur_proto::message::{
    ChatMessage, ConversationSummary, HistoryCursor, MessageId, Timestamp, UserId,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::client::{ChatClient, ClientUpdate, ConnectionStatus, HistoryPage, JoinedChat};
use crate::error::ClientError;

/// The protocol surface the controller drives.
pub trait ChatApi: Send + Sync {
    /// Current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Open the conversation with `peer`.
    fn join_chat(
        &self,
        peer: &UserId,
    ) -> impl Future<Output = Result<JoinedChat, ClientError>> + Send;

    /// Close the open conversation.
    fn leave_chat(&self) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Send a message.
    fn send_message(
        &self,
        receiver: &UserId,
        content: &str,
    ) -> impl Future<Output = Result<ChatMessage, ClientError>> + Send;

    /// Typing started.
    fn typing_start(&self, receiver: &UserId) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Typing stopped.
    fn typing_stop(&self, receiver: &UserId) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Mark `sender`'s messages read.
    fn mark_read(&self, sender: &UserId) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// Fetch the conversation list.
    fn get_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, ClientError>> + Send;

    /// Fetch an older page.
    fn load_more(
        &self,
        cursor: HistoryCursor,
    ) -> impl Future<Output = Result<HistoryPage, ClientError>> + Send;
}

impl ChatApi for ChatClient {
    fn status(&self) -> ConnectionStatus {
        Self::status(self)
    }

    async fn join_chat(&self, peer: &UserId) -> Result<JoinedChat, ClientError> {
        Self::join_chat(self, peer).await
    }

    async fn leave_chat(&self) -> Result<(), ClientError> {
        Self::leave_chat(self).await
    }

    async fn send_message(&self, receiver: &UserId, content: &str) -> Result<ChatMessage, ClientError> {
        Self::send_message(self, receiver, content).await
    }

    async fn typing_start(&self, receiver: &UserId) -> Result<(), ClientError> {
        Self::typing_start(self, receiver).await
    }

    async fn typing_stop(&self, receiver: &UserId) -> Result<(), ClientError> {
        Self::typing_stop(self, receiver).await
    }

    async fn mark_read(&self, sender: &UserId) -> Result<u64, ClientError> {
        Self::mark_read(self, sender).await
    }

    async fn get_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        Self::get_conversations(self).await
    }

    async fn load_more(&self, cursor: HistoryCursor) -> Result<HistoryPage, ClientError> {
        Self::load_more(self, cursor).await
    }
}

/// Delivery state of a message in the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Sent, awaiting the server's `message_sent`.
    Pending,
    /// Stored by the server.
    Confirmed,
    /// Refused or lost in transit; [`ChatController::retry`] resends it.
    FailedRetryable(String),
}

/// A message as the UI shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewMessage {
    /// Stable handle for retry; unique within the controller.
    pub local_id: u64,
    /// The message. For pending entries the id and timestamp are local
    /// placeholders until the server confirms.
    pub message: ChatMessage,
    /// Delivery state.
    pub delivery: Delivery,
}

#[derive(Debug)]
struct ViewState {
    status: ConnectionStatus,
    peer: Option<UserId>,
    messages: Vec<ViewMessage>,
    has_more: bool,
    conversations: Vec<ConversationSummary>,
    typing: BTreeSet<UserId>,
    next_local_id: u64,
}

/// What `mark_as_read` changed, so it can be put back.
struct ReadSnapshot {
    sender: UserId,
    unread_before: Option<u32>,
    flipped: Vec<MessageId>,
}

/// Chat view state driven by a [`ChatApi`].
pub struct ChatController<A> {
    api: A,
    me: UserId,
    state: Mutex<ViewState>,
}

impl<A: ChatApi> ChatController<A> {
    /// Creates an empty view for `me`.
    pub fn new(api: A, me: UserId) -> Self {
        let status = api.status();
        Self {
            api,
            me,
            state: Mutex::new(ViewState {
                status,
                peer: None,
                messages: Vec::new(),
                has_more: false,
                conversations: Vec::new(),
                typing: BTreeSet::new(),
                next_local_id: 1,
            }),
        }
    }

    /// The underlying API.
    pub const fn api(&self) -> &A {
        &self.api
    }

    // -- view accessors ----------------------------------------------------

    /// Connection status as last reported.
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Counterpart of the open conversation.
    pub fn current_peer(&self) -> Option<UserId> {
        self.state.lock().peer.clone()
    }

    /// Messages of the open conversation, oldest first.
    pub fn messages(&self) -> Vec<ViewMessage> {
        self.state.lock().messages.clone()
    }

    /// Whether older history can be loaded.
    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    /// Conversation list, most recent first.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.state.lock().conversations.clone()
    }

    /// Unread messages across all conversations.
    pub fn unread_count(&self) -> u32 {
        self.state
            .lock()
            .conversations
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    /// Peers currently typing to us.
    pub fn typing_peers(&self) -> BTreeSet<UserId> {
        self.state.lock().typing.clone()
    }

    /// Whether sending is possible right now.
    pub fn can_send(&self) -> bool {
        let state = self.state.lock();
        state.status == ConnectionStatus::Connected && state.peer.is_some()
    }

    // -- actions -----------------------------------------------------------

    /// Open the conversation with `peer`, replacing the current view.
    ///
    /// # Errors
    ///
    /// Whatever the server or transport reports; the view is unchanged.
    pub async fn join_chat(&self, peer: &UserId) -> Result<(), ClientError> {
        let joined = self.api.join_chat(peer).await?;
        let mut state = self.state.lock();
        state.peer = Some(joined.history.peer_id.clone());
        state.messages.clear();
        state.typing.clear();
        state.has_more = joined.history.has_more;
        for message in joined.history.messages {
            push_confirmed(&mut state, message);
        }
        state.conversations = joined.conversations;
        Ok(())
    }

    /// Close the open conversation.
    ///
    /// # Errors
    ///
    /// Whatever the server or transport reports.
    pub async fn leave_chat(&self) -> Result<(), ClientError> {
        self.api.leave_chat().await?;
        let mut state = self.state.lock();
        state.peer = None;
        state.messages.clear();
        state.has_more = false;
        state.typing.clear();
        Ok(())
    }

    /// Send `content` to the open conversation.
    ///
    /// The message appears as [`Delivery::Pending`] immediately. On success
    /// it is replaced by the stored message. A retryable failure leaves it
    /// as [`Delivery::FailedRetryable`]; a terminal failure removes it.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoConversation`] without an open conversation, else
    /// whatever the server or transport reports.
    pub async fn send_message(&self, content: &str) -> Result<ChatMessage, ClientError> {
        let (peer, local_id) = {
            let mut state = self.state.lock();
            let peer = state.peer.clone().ok_or(ClientError::NoConversation)?;
            let local_id = apply_pending_send(&mut state, &self.me, &peer, content);
            (peer, local_id)
        };
        self.deliver(local_id, &peer, content).await
    }

    /// Resend a message left as [`Delivery::FailedRetryable`].
    ///
    /// # Errors
    ///
    /// [`ClientError::UnexpectedReply`] if no such failed entry exists, else
    /// as for [`ChatController::send_message`].
    pub async fn retry(&self, local_id: u64) -> Result<ChatMessage, ClientError> {
        let (peer, content) = {
            let mut state = self.state.lock();
            let entry = state
                .messages
                .iter_mut()
                .find(|m| {
                    m.local_id == local_id && matches!(m.delivery, Delivery::FailedRetryable(_))
                })
                .ok_or(ClientError::UnexpectedReply("no failed message with that id"))?;
            entry.delivery = Delivery::Pending;
            (entry.message.receiver_id.clone(), entry.message.content.clone())
        };
        self.deliver(local_id, &peer, &content).await
    }

    async fn deliver(
        &self,
        local_id: u64,
        peer: &UserId,
        content: &str,
    ) -> Result<ChatMessage, ClientError> {
        match self.api.send_message(peer, content).await {
            Ok(message) => {
                confirm_send(&mut self.state.lock(), local_id, message.clone());
                Ok(message)
            }
            Err(e) => {
                tracing::warn!(local_id, err = %e, "send failed");
                rollback_send(&mut self.state.lock(), local_id, &e);
                Err(e)
            }
        }
    }

    /// Tell the open conversation's peer we are typing.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoConversation`] without an open conversation, else
    /// whatever the server or transport reports.
    pub async fn start_typing(&self) -> Result<(), ClientError> {
        let peer = self.require_peer()?;
        self.api.typing_start(&peer).await
    }

    /// Tell the open conversation's peer we stopped typing.
    ///
    /// # Errors
    ///
    /// As for [`ChatController::start_typing`].
    pub async fn stop_typing(&self) -> Result<(), ClientError> {
        let peer = self.require_peer()?;
        self.api.typing_stop(&peer).await
    }

    /// Mark the open conversation read. Unread state clears immediately
    /// and is restored if the server refuses.
    ///
    /// # Errors
    ///
    /// As for [`ChatController::start_typing`].
    pub async fn mark_as_read(&self) -> Result<u64, ClientError> {
        let snapshot = {
            let mut state = self.state.lock();
            let peer = state.peer.clone().ok_or(ClientError::NoConversation)?;
            apply_mark_read(&mut state, &self.me, &peer)
        };
        match self.api.mark_read(&snapshot.sender).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                tracing::warn!(sender = %snapshot.sender, err = %e, "mark_read failed");
                rollback_mark_read(&mut self.state.lock(), snapshot);
                Err(e)
            }
        }
    }

    /// Prepend the next older page; returns how many messages were added.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoConversation`] without an open conversation, else
    /// whatever the server or transport reports.
    pub async fn load_more_messages(&self) -> Result<usize, ClientError> {
        let cursor = {
            let state = self.state.lock();
            if state.peer.is_none() {
                return Err(ClientError::NoConversation);
            }
            if !state.has_more {
                return Ok(0);
            }
            match state
                .messages
                .iter()
                .find(|m| m.delivery == Delivery::Confirmed)
            {
                Some(oldest) => HistoryCursor::BeforeMessageId(oldest.message.id),
                None => HistoryCursor::BeforeTimestamp(Timestamp::now()),
            }
        };

        let page = self.api.load_more(cursor).await?;
        let mut state = self.state.lock();
        if state.peer.as_ref() != Some(&page.peer_id) {
            // Conversation changed while the page was in flight.
            return Ok(0);
        }
        state.has_more = page.has_more;
        let mut older = Vec::with_capacity(page.messages.len());
        for message in page.messages {
            if contains_message(&state.messages, &message.id) {
                continue;
            }
            let local_id = next_local_id(&mut state);
            older.push(ViewMessage {
                local_id,
                message,
                delivery: Delivery::Confirmed,
            });
        }
        let added = older.len();
        older.append(&mut state.messages);
        state.messages = older;
        Ok(added)
    }

    /// Re-fetch the conversation list.
    ///
    /// # Errors
    ///
    /// Whatever the server or transport reports.
    pub async fn refresh_conversations(&self) -> Result<(), ClientError> {
        let conversations = self.api.get_conversations().await?;
        self.state.lock().conversations = conversations;
        Ok(())
    }

    fn require_peer(&self) -> Result<UserId, ClientError> {
        self.state.lock().peer.clone().ok_or(ClientError::NoConversation)
    }

    // -- server pushes -----------------------------------------------------

    /// Fold a push or status change into the view.
    pub fn apply_update(&self, update: ClientUpdate) {
        let mut state = self.state.lock();
        match update {
            ClientUpdate::Status(status) => {
                state.status = status;
                if status != ConnectionStatus::Connected {
                    // Typing does not survive a reconnect.
                    state.typing.clear();
                }
            }
            ClientUpdate::Event(event) => self.apply_event(&mut state, event),
        }
    }

    fn apply_event(&self, state: &mut ViewState, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } | ServerEvent::MessageSent { message } => {
                self.apply_incoming(state, message);
            }
            ServerEvent::UserTyping { user_id, is_typing } => {
                if is_typing {
                    state.typing.insert(user_id);
                } else {
                    state.typing.remove(&user_id);
                }
            }
            ServerEvent::MessagesRead { read_by } => {
                for entry in &mut state.messages {
                    if entry.message.sender_id == self.me && entry.message.receiver_id == read_by {
                        entry.message.read = true;
                    }
                }
            }
            ServerEvent::Conversations { conversations } => state.conversations = conversations,
            ServerEvent::ChatHistory {
                peer_id,
                messages,
                has_more,
            } => {
                if state.peer.as_ref() == Some(&peer_id) {
                    merge_history(state, messages, has_more);
                }
            }
            ServerEvent::Connected { .. }
            | ServerEvent::ReadMarked { .. }
            | ServerEvent::Ack {}
            | ServerEvent::Error { .. } => {
                tracing::debug!(event = event.name(), "ignoring unsolicited event");
            }
        }
    }

    fn apply_incoming(&self, state: &mut ViewState, message: ChatMessage) {
        let Some(counterpart) = message.counterpart(&self.me).cloned() else {
            return;
        };
        let open = state.peer.as_ref() == Some(&counterpart);
        let inbound = message.receiver_id == self.me;

        if inbound {
            state.typing.remove(&counterpart);
        }
        bump_conversation(state, &counterpart, &message, inbound && !open);
        if open && !contains_message(&state.messages, &message.id) {
            push_confirmed(state, message);
        }
    }

    /// Apply updates from `updates` until the channel closes.
    pub async fn run_updates(self: Arc<Self>, mut updates: broadcast::Receiver<ClientUpdate>) {
        loop {
            match updates.recv().await {
                Ok(update) => self.apply_update(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "controller fell behind on updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Optimistic mutations: apply / confirm / rollback
// ---------------------------------------------------------------------------

fn apply_pending_send(state: &mut ViewState, me: &UserId, peer: &UserId, content: &str) -> u64 {
    let local_id = next_local_id(state);
    state.messages.push(ViewMessage {
        local_id,
        message: ChatMessage {
            id: MessageId::new(),
            sender_id: me.clone(),
            receiver_id: peer.clone(),
            content: content.trim().to_string(),
            created_at: Timestamp::now(),
            read: false,
        },
        delivery: Delivery::Pending,
    });
    local_id
}

fn confirm_send(state: &mut ViewState, local_id: u64, message: ChatMessage) {
    // The same message may already have arrived as a push from another device.
    state
        .messages
        .retain(|m| m.local_id == local_id || m.message.id != message.id);
    if let Some(entry) = state.messages.iter_mut().find(|m| m.local_id == local_id) {
        entry.message = message;
        entry.delivery = Delivery::Confirmed;
    }
}

fn rollback_send(state: &mut ViewState, local_id: u64, error: &ClientError) {
    if error.is_retryable() {
        if let Some(entry) = state.messages.iter_mut().find(|m| m.local_id == local_id) {
            entry.delivery = Delivery::FailedRetryable(error.to_string());
        }
    } else {
        state.messages.retain(|m| m.local_id != local_id);
    }
}

fn apply_mark_read(state: &mut ViewState, me: &UserId, sender: &UserId) -> ReadSnapshot {
    let unread_before = state
        .conversations
        .iter_mut()
        .find(|c| &c.peer.id == sender)
        .map(|c| std::mem::replace(&mut c.unread_count, 0));
    let mut flipped = Vec::new();
    for entry in &mut state.messages {
        let m = &mut entry.message;
        if &m.sender_id == sender && &m.receiver_id == me && !m.read {
            m.read = true;
            flipped.push(m.id);
        }
    }
    ReadSnapshot {
        sender: sender.clone(),
        unread_before,
        flipped,
    }
}

fn rollback_mark_read(state: &mut ViewState, snapshot: ReadSnapshot) {
    if let Some(unread) = snapshot.unread_before
        && let Some(summary) = state
            .conversations
            .iter_mut()
            .find(|c| c.peer.id == snapshot.sender)
    {
        summary.unread_count = unread;
    }
    for entry in &mut state.messages {
        if snapshot.flipped.contains(&entry.message.id) {
            entry.message.read = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const fn next_local_id(state: &mut ViewState) -> u64 {
    let id = state.next_local_id;
    state.next_local_id += 1;
    id
}

fn contains_message(messages: &[ViewMessage], id: &MessageId) -> bool {
    messages
        .iter()
        .any(|m| m.delivery == Delivery::Confirmed && &m.message.id == id)
}

fn push_confirmed(state: &mut ViewState, message: ChatMessage) {
    let local_id = next_local_id(state);
    // Keep local pending entries after everything the server has stored.
    let at = state
        .messages
        .iter()
        .position(|m| m.delivery != Delivery::Confirmed)
        .unwrap_or(state.messages.len());
    state.messages.insert(
        at,
        ViewMessage {
            local_id,
            message,
            delivery: Delivery::Confirmed,
        },
    );
}

/// Replace stored messages with a fresh page, keeping unsent local entries.
fn merge_history(state: &mut ViewState, messages: Vec<ChatMessage>, has_more: bool) {
    state.messages.retain(|m| m.delivery != Delivery::Confirmed);
    state.has_more = has_more;
    for message in messages {
        push_confirmed(state, message);
    }
}

fn bump_conversation(state: &mut ViewState, peer: &UserId, message: &ChatMessage, unread: bool) {
    let Some(index) = state.conversations.iter().position(|c| &c.peer.id == peer) else {
        // Unknown counterpart: the next conversations refresh brings its profile.
        return;
    };
    let mut summary = state.conversations.remove(index);
    summary.last_message = message.clone();
    if unread {
        summary.unread_count = summary.unread_count.saturating_add(1);
    }
    state.conversations.insert(0, summary);
}
