//! Core data types of the Murmur messaging protocol.
//!
//! Identifiers, timestamps, persisted chat messages, conversation keys and
//! the derived conversation summaries. These are the shapes the server
//! stores, replays and fans out, and the shapes the client renders.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default upper bound on message content, in characters.
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

/// Maximum length of a user identifier, in bytes.
pub const MAX_USER_ID_LEN: usize = 64;

/// Error returned when user-supplied input fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty after trimming whitespace.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the configured character limit.
    #[error("message too long ({chars} characters, max {max})")]
    TooLong {
        /// Character count of the trimmed content.
        chars: usize,
        /// Maximum allowed characters.
        max: usize,
    },
    /// A user identifier is empty, too long, or contains illegal characters.
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
}

/// Stable, opaque identifier of a user.
///
/// Construction is unchecked so that values decoded off the wire can be
/// carried around; call [`UserId::validate`] before trusting one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier without validating it.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a user identifier, rejecting syntactically invalid input.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUserId`] if the id is empty, longer
    /// than [`MAX_USER_ID_LEN`], or contains characters outside
    /// `[A-Za-z0-9-_.@]`.
    pub fn parse(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    /// Checks that this identifier is syntactically valid.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUserId`] on failure.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let valid = !self.0.is_empty()
            && self.0.len() <= MAX_USER_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'));
        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidUserId(self.0.clone()))
        }
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
///
/// Assigned by the message store; a client only learns it from the
/// `message_sent` acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Identity fields of a user as supplied by the identity verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Stable identifier.
    pub id: UserId,
    /// Human-readable name.
    pub display_name: String,
    /// Avatar reference (URL or asset key), if any.
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserProfile {
    /// Creates a profile without an avatar.
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

/// A persisted direct message.
///
/// Immutable except for `read`, which only ever flips from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Trimmed, non-empty text.
    pub content: String,
    /// When the store accepted the message.
    pub created_at: Timestamp,
    /// Whether the receiver has marked the message read.
    pub read: bool,
}

impl ChatMessage {
    /// Returns the conversation this message belongs to.
    #[must_use]
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id.clone(), self.receiver_id.clone())
    }

    /// Returns the participant that is not `me`, if `me` takes part.
    #[must_use]
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if &self.sender_id == me {
            Some(&self.receiver_id)
        } else if &self.receiver_id == me {
            Some(&self.sender_id)
        } else {
            None
        }
    }
}

/// The unordered pair of users that identifies a direct conversation.
///
/// Stored sorted, so `(a, b)` and `(b, a)` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Builds the key for the conversation between `a` and `b`.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Returns both participants, lowest first.
    #[must_use]
    pub const fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    /// Returns `true` if `user` is one of the participants.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// Returns `true` if `message` belongs to this conversation.
    #[must_use]
    pub fn includes(&self, message: &ChatMessage) -> bool {
        message.conversation() == *self
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Per-counterpart summary used to render a conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The other participant.
    pub peer: UserProfile,
    /// Most recent message in either direction.
    pub last_message: ChatMessage,
    /// Messages from the peer to the caller that are still unread.
    pub unread_count: u32,
}

/// Position in a conversation's history to page backwards from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryCursor {
    /// Messages strictly older than the given message.
    BeforeMessageId(MessageId),
    /// Messages created strictly before the given instant.
    BeforeTimestamp(Timestamp),
}

/// Validates message content and returns the trimmed text.
///
/// Length is counted in characters, not bytes.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if nothing but whitespace remains, or
/// [`ValidationError::TooLong`] if the trimmed text exceeds `max_chars`.
pub fn validate_content(raw: &str, max_chars: usize) -> Result<&str, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let chars = trimmed.chars().count();
    if chars > max_chars {
        return Err(ValidationError::TooLong {
            chars,
            max: max_chars,
        });
    }
    Ok(trimmed)
}
