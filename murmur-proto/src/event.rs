//! Client and server events exchanged over the Murmur WebSocket.
//!
//! Every client request is wrapped in a [`ClientFrame`] carrying a
//! client-chosen `id`. The server answers with one or more [`ServerFrame`]s
//! whose `reply_to` echoes that id; frames with `reply_to: None` are
//! unsolicited pushes (new messages, typing, read receipts).

use serde::{Deserialize, Serialize};

use crate::message::{
    ChatMessage, ConversationSummary, HistoryCursor, UserId, UserProfile,
};

/// Error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The connection has no verified identity.
    NotAuthenticated,
    /// The caller may not perform this action (self-chat, someone else's data).
    NotAuthorized,
    /// Unknown peer, conversation or cursor.
    NotFound,
    /// Malformed or out-of-bounds input.
    InvalidInput,
    /// A store or transport hiccup; the request can be retried unchanged.
    TransientFailure,
    /// Anything unexpected; details are only logged server-side.
    InternalError,
}

impl ErrorCode {
    /// Returns `true` if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientFailure)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotAuthenticated => "NotAuthenticated",
            Self::NotAuthorized => "NotAuthorized",
            Self::NotFound => "NotFound",
            Self::InvalidInput => "InvalidInput",
            Self::TransientFailure => "TransientFailure",
            Self::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Requests a client can issue once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Open the conversation with another user.
    JoinChat {
        /// The counterpart.
        other_user_id: UserId,
    },
    /// Close the currently open conversation.
    LeaveChat {},
    /// Send a direct message.
    SendMessage {
        /// Recipient.
        receiver_id: UserId,
        /// Raw text; trimmed and validated by the server.
        content: String,
    },
    /// The caller started typing to `receiver_id`.
    TypingStart {
        /// Who should see the indicator.
        receiver_id: UserId,
    },
    /// The caller stopped typing to `receiver_id`.
    TypingStop {
        /// Who should see the indicator cleared.
        receiver_id: UserId,
    },
    /// Mark everything `sender_id` sent to the caller as read.
    MarkRead {
        /// Author of the messages being marked.
        sender_id: UserId,
    },
    /// Fetch the caller's conversation list.
    GetConversations {},
    /// Fetch the next older page of the open conversation.
    LoadMore {
        /// Page boundary.
        cursor: HistoryCursor,
    },
}

impl ClientEvent {
    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveChat {} => "leave_chat",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MarkRead { .. } => "mark_read",
            Self::GetConversations {} => "get_conversations",
            Self::LoadMore { .. } => "load_more",
        }
    }
}

/// A client request with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Client-chosen id echoed back in `reply_to`.
    pub id: u64,
    /// The request itself.
    pub event: ClientEvent,
}

/// Events emitted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Authentication succeeded; the session is live.
    Connected {
        /// The verified identity.
        user: UserProfile,
    },
    /// A page of conversation history, oldest first.
    ChatHistory {
        /// The counterpart of the conversation.
        peer_id: UserId,
        /// Messages in chronological order.
        messages: Vec<ChatMessage>,
        /// Whether an older page exists.
        has_more: bool,
    },
    /// The caller's conversation list, most recently active first.
    Conversations {
        /// One entry per counterpart.
        conversations: Vec<ConversationSummary>,
    },
    /// A `send_message` was persisted.
    MessageSent {
        /// The stored message, including its id and timestamp.
        message: ChatMessage,
    },
    /// Someone sent the receiving user a message.
    NewMessage {
        /// The stored message.
        message: ChatMessage,
    },
    /// Typing indicator change from `user_id`.
    UserTyping {
        /// Who is (or stopped) typing.
        user_id: UserId,
        /// Current state.
        is_typing: bool,
    },
    /// The receiving user's messages to `read_by` were read.
    MessagesRead {
        /// The reader.
        read_by: UserId,
    },
    /// A `mark_read` completed.
    ReadMarked {
        /// Author whose messages were marked.
        sender_id: UserId,
        /// How many messages flipped to read.
        updated: u64,
    },
    /// Generic success for requests without a payload.
    Ack {},
    /// A request failed.
    Error {
        /// Machine-readable failure class.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl ServerEvent {
    /// Builds an [`ServerEvent::Error`].
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ChatHistory { .. } => "chat_history",
            Self::Conversations { .. } => "conversations",
            Self::MessageSent { .. } => "message_sent",
            Self::NewMessage { .. } => "new_message",
            Self::UserTyping { .. } => "user_typing",
            Self::MessagesRead { .. } => "messages_read",
            Self::ReadMarked { .. } => "read_marked",
            Self::Ack {} => "ack",
            Self::Error { .. } => "error",
        }
    }
}

/// A server event, correlated with the request that caused it if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    /// Id of the request this answers; `None` for pushes.
    #[serde(default)]
    pub reply_to: Option<u64>,
    /// The event.
    pub event: ServerEvent,
}

impl ServerFrame {
    /// A direct response to request `id`.
    #[must_use]
    pub const fn reply(id: u64, event: ServerEvent) -> Self {
        Self {
            reply_to: Some(id),
            event,
        }
    }

    /// An unsolicited push.
    #[must_use]
    pub const fn push(event: ServerEvent) -> Self {
        Self {
            reply_to: None,
            event,
        }
    }
}
