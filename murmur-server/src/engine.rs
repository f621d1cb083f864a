//! Chat protocol engine.
//!
//! Implements every client operation against a [`MessageStore`] and the
//! shared [`PresenceRegistry`]. Each operation takes the caller's
//! [`Session`] mutably; the gateway feeds frames in arrival order, so one
//! session's operations never interleave. [`ChatEngine::dispatch`] turns an
//! inbound frame into reply frames, including the `error` reply when an
//! operation fails.

use std::sync::Arc;
use std::time::Duration;

use murmur_proto::event::{ClientEvent, ClientFrame, ErrorCode, ServerEvent, ServerFrame};
use murmur_proto::message::{
    ChatMessage, ConversationSummary, DEFAULT_MAX_MESSAGE_CHARS, HistoryCursor, UserId,
    UserProfile, validate_content,
};
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::presence::PresenceRegistry;
use crate::session::Session;
use crate::store::{MessageStore, StoreError};

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// Default typing-indicator expiry.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Tunables for [`ChatEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages per history page.
    pub page_size: usize,
    /// Maximum characters in trimmed message content.
    pub max_message_chars: usize,
    /// How long a typing indicator stays on without a refresh.
    pub typing_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

/// One page of conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// The counterpart of the conversation.
    pub peer_id: UserId,
    /// Messages ordered oldest to newest.
    pub messages: Vec<ChatMessage>,
    /// Whether an older page exists.
    pub has_more: bool,
}

impl HistoryPage {
    fn into_event(self) -> ServerEvent {
        ServerEvent::ChatHistory {
            peer_id: self.peer_id,
            messages: self.messages,
            has_more: self.has_more,
        }
    }
}

/// The chat protocol engine shared by every connection.
pub struct ChatEngine<S> {
    store: Arc<S>,
    presence: Arc<PresenceRegistry>,
    config: EngineConfig,
}

impl<S: MessageStore + 'static> ChatEngine<S> {
    /// Creates an engine over an injected store and presence registry.
    #[must_use]
    pub const fn new(store: Arc<S>, presence: Arc<PresenceRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            presence,
            config,
        }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The presence registry.
    #[must_use]
    pub const fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Engine tunables.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a session for a verified identity: records the identity in the
    /// store, registers the session and queues `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] if the identity cannot be recorded; no
    /// session is registered in that case.
    pub async fn connect(
        &self,
        profile: UserProfile,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<Session, ChatError> {
        self.store.upsert_user(&profile).await?;
        let session = Session::new(profile, outbound);
        self.presence.register(session.user_id(), session.handle());
        session
            .send(ServerFrame::push(ServerEvent::Connected {
                user: session.profile().clone(),
            }))
            .await;
        tracing::info!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            "session authenticated"
        );
        Ok(session)
    }

    /// Processes one inbound frame and queues its replies on the session.
    pub async fn dispatch(&self, session: &mut Session, frame: ClientFrame) {
        let ClientFrame { id, event } = frame;
        let name = event.name();
        tracing::debug!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            request_id = id,
            event = name,
            "dispatching"
        );

        let replies = match self.handle(session, event).await {
            Ok(events) => events,
            Err(err) => {
                self.log_failure(session, name, &err);
                vec![ServerEvent::error(err.code(), err.public_message())]
            }
        };
        for event in replies {
            if !session.send(ServerFrame::reply(id, event)).await {
                tracing::debug!(session_id = %session.id(), "writer gone, dropping reply");
                break;
            }
        }
    }

    async fn handle(
        &self,
        session: &mut Session,
        event: ClientEvent,
    ) -> Result<Vec<ServerEvent>, ChatError> {
        Ok(match event {
            ClientEvent::JoinChat { other_user_id } => {
                let (page, conversations) = self.join_chat(session, &other_user_id).await?;
                vec![page.into_event(), ServerEvent::Conversations { conversations }]
            }
            ClientEvent::LeaveChat {} => {
                self.leave_chat(session);
                vec![ServerEvent::Ack {}]
            }
            ClientEvent::SendMessage {
                receiver_id,
                content,
            } => {
                let message = self.send_message(session, &receiver_id, &content).await?;
                vec![ServerEvent::MessageSent { message }]
            }
            ClientEvent::TypingStart { receiver_id } => {
                self.typing_start(session, &receiver_id).await?;
                vec![ServerEvent::Ack {}]
            }
            ClientEvent::TypingStop { receiver_id } => {
                self.typing_stop(session, &receiver_id)?;
                vec![ServerEvent::Ack {}]
            }
            ClientEvent::MarkRead { sender_id } => {
                let updated = self.mark_read(session, &sender_id).await?;
                vec![ServerEvent::ReadMarked { sender_id, updated }]
            }
            ClientEvent::GetConversations {} => {
                let conversations = self.get_conversations(session).await?;
                vec![ServerEvent::Conversations { conversations }]
            }
            ClientEvent::LoadMore { cursor } => {
                vec![self.load_more(session, cursor).await?.into_event()]
            }
        })
    }

    fn log_failure(&self, session: &Session, event: &str, err: &ChatError) {
        match err.code() {
            ErrorCode::InternalError => tracing::error!(
                user_id = %session.user_id(),
                event,
                error = %err,
                "request failed"
            ),
            ErrorCode::TransientFailure => tracing::warn!(
                user_id = %session.user_id(),
                event,
                error = %err,
                "request failed transiently"
            ),
            _ => tracing::debug!(
                user_id = %session.user_id(),
                event,
                error = %err,
                "request rejected"
            ),
        }
    }

    /// Opens the conversation with `peer`, leaving any other open one, and
    /// returns its newest history page with the caller's conversation list.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed id, `NotAuthorized` for the caller's
    /// own id, `NotFound` for an unknown user, or a store error while
    /// reading. None of these touch session state: the previous
    /// conversation stays open.
    pub async fn join_chat(
        &self,
        session: &mut Session,
        peer: &UserId,
    ) -> Result<(HistoryPage, Vec<ConversationSummary>), ChatError> {
        self.check_counterpart(session, peer)?;
        self.require_known(peer).await?;

        // Reads first so a failed join leaves the session where it was.
        let page = self.fetch_page(session.user_id(), peer, None).await?;
        let conversations = self.store.get_conversation_summaries(session.user_id()).await?;

        if session.current_peer().is_some_and(|current| current != peer) {
            self.leave_chat(session);
        }
        session.set_current_peer(peer.clone());
        tracing::debug!(user_id = %session.user_id(), peer_id = %peer, "joined conversation");
        Ok((page, conversations))
    }

    /// Closes the open conversation, clearing a live typing indicator toward
    /// its peer. A no-op when idle.
    pub fn leave_chat(&self, session: &mut Session) {
        let Some(peer) = session.take_current_peer() else {
            return;
        };
        if session.cancel_typing(&peer) {
            self.push_typing(session.user_id(), &peer, false);
        }
        tracing::debug!(user_id = %session.user_id(), peer_id = %peer, "left conversation");
    }

    /// Persists a message and fans it out to every session of the receiver.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed id or content, `NotAuthorized` when
    /// sending to oneself, `NotFound` for an unknown receiver, and a store
    /// error if persistence fails. On any error nothing is fanned out.
    pub async fn send_message(
        &self,
        session: &mut Session,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        self.check_counterpart(session, receiver)?;
        let content = validate_content(content, self.config.max_message_chars)?;
        self.require_known(receiver).await?;

        let message = self
            .store
            .create_message(session.user_id(), receiver, content)
            .await?;

        let delivered = self.presence.deliver_to_user(
            receiver,
            &ServerFrame::push(ServerEvent::NewMessage {
                message: message.clone(),
            }),
        );
        tracing::debug!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            delivered,
            "message stored"
        );
        Ok(message)
    }

    /// Shows the caller's typing indicator to `receiver` and (re)arms its
    /// expiry timer.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed id, `NotAuthorized` for the caller's
    /// own id, `NotFound` for an unknown receiver.
    pub async fn typing_start(
        &self,
        session: &mut Session,
        receiver: &UserId,
    ) -> Result<(), ChatError> {
        self.check_counterpart(session, receiver)?;
        self.require_known(receiver).await?;
        self.push_typing(session.user_id(), receiver, true);

        let presence = Arc::clone(&self.presence);
        let sender = session.user_id().clone();
        let target = receiver.clone();
        let timeout = self.config.typing_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::trace!(user_id = %sender, receiver_id = %target, "typing indicator expired");
            presence.deliver_to_user(&target, &typing_frame(&sender, false));
        });
        session.arm_typing(receiver.clone(), timer);
        Ok(())
    }

    /// Clears the caller's typing indicator toward `receiver` immediately.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed id, `NotAuthorized` for the caller's
    /// own id. The receiver is not looked up: a stop only ever clears state.
    pub fn typing_stop(&self, session: &mut Session, receiver: &UserId) -> Result<(), ChatError> {
        self.check_counterpart(session, receiver)?;
        session.cancel_typing(receiver);
        self.push_typing(session.user_id(), receiver, false);
        Ok(())
    }

    /// Marks everything `sender` sent to the caller as read and notifies the
    /// sender if anything changed. Returns the number of messages updated.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed id, `NotAuthorized` for the caller's
    /// own id, or a store error.
    pub async fn mark_read(&self, session: &mut Session, sender: &UserId) -> Result<u64, ChatError> {
        self.check_counterpart(session, sender)?;
        let updated = self.store.mark_read(sender, session.user_id()).await?;
        if updated > 0 {
            self.presence.deliver_to_user(
                sender,
                &ServerFrame::push(ServerEvent::MessagesRead {
                    read_by: session.user_id().clone(),
                }),
            );
        }
        tracing::debug!(
            user_id = %session.user_id(),
            sender_id = %sender,
            updated,
            "marked read"
        );
        Ok(updated)
    }

    /// The caller's conversation summaries, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the summaries cannot be computed.
    pub async fn get_conversations(
        &self,
        session: &Session,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        Ok(self.store.get_conversation_summaries(session.user_id()).await?)
    }

    /// The page of the open conversation that precedes `cursor`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no conversation is open or when the cursor names a
    /// message outside it.
    pub async fn load_more(
        &self,
        session: &Session,
        cursor: HistoryCursor,
    ) -> Result<HistoryPage, ChatError> {
        let Some(peer) = session.current_peer().cloned() else {
            return Err(ChatError::NotFound("no conversation is open".into()));
        };
        self.fetch_page(session.user_id(), &peer, Some(cursor)).await
    }

    /// Runs disconnect cleanup. Safe to call more than once.
    pub fn disconnect(&self, session: &mut Session) {
        if !session.mark_closed() {
            return;
        }
        self.leave_chat(session);
        for peer in session.cancel_all_typing() {
            self.push_typing(session.user_id(), &peer, false);
        }
        self.presence.unregister(session.user_id(), session.id());
        tracing::info!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            "session closed"
        );
    }

    fn check_counterpart(&self, session: &Session, other: &UserId) -> Result<(), ChatError> {
        other.validate()?;
        if other == session.user_id() {
            return Err(ChatError::NotAuthorized(
                "cannot start a conversation with yourself".into(),
            ));
        }
        Ok(())
    }

    async fn require_known(&self, user: &UserId) -> Result<(), ChatError> {
        match self.store.get_user(user).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::NotFound(format!("unknown user {user}"))),
        }
    }

    async fn fetch_page(
        &self,
        me: &UserId,
        peer: &UserId,
        cursor: Option<HistoryCursor>,
    ) -> Result<HistoryPage, ChatError> {
        let page_size = self.config.page_size;
        let mut messages = match self
            .store
            .get_history(me, peer, cursor, page_size + 1)
            .await
        {
            Err(StoreError::NotFound(_)) => {
                return Err(ChatError::NotFound("cursor is not in this conversation".into()));
            }
            other => other?,
        };
        let has_more = messages.len() > page_size;
        messages.truncate(page_size);
        messages.reverse();
        Ok(HistoryPage {
            peer_id: peer.clone(),
            messages,
            has_more,
        })
    }

    fn push_typing(&self, sender: &UserId, receiver: &UserId, is_typing: bool) {
        self.presence
            .deliver_to_user(receiver, &typing_frame(sender, is_typing));
    }
}

fn typing_frame(sender: &UserId, is_typing: bool) -> ServerFrame {
    ServerFrame::push(ServerEvent::UserTyping {
        user_id: sender.clone(),
        is_typing,
    })
}
