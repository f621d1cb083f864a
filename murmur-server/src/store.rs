//! Durable message store interface and the in-memory implementation.
//!
//! The [`MessageStore`] trait is the engine's only window onto persisted
//! state: messages, their read flags, and the identity cache used for
//! existence checks and conversation summaries. [`InMemoryStore`] backs
//! tests and store-less deployments; [`crate::sqlite::SqliteStore`] is the
//! persistent adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use murmur_proto::message::{
    ChatMessage, ConversationKey, ConversationSummary, HistoryCursor, MessageId, Timestamp, UserId,
    UserProfile,
};
use tokio::sync::Mutex;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing storage is temporarily unreachable; retrying may succeed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The referenced item does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Returns `true` if the same call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Persistence operations the chat engine depends on.
///
/// Implementations include:
/// - [`InMemoryStore`] for tests and ephemeral deployments
/// - [`crate::sqlite::SqliteStore`] for durable storage
pub trait MessageStore: Send + Sync {
    /// Persist a new unread message and return it with its assigned id and
    /// timestamp. `content` is already validated and trimmed.
    fn create_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> impl std::future::Future<Output = Result<ChatMessage, StoreError>> + Send;

    /// Messages of the conversation between `a` and `b`, newest first,
    /// strictly older than `cursor` when given, at most `limit` of them.
    ///
    /// A `BeforeMessageId` cursor naming a message outside the conversation
    /// yields [`StoreError::NotFound`].
    fn get_history(
        &self,
        a: &UserId,
        b: &UserId,
        cursor: Option<HistoryCursor>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, StoreError>> + Send;

    /// Flip every unread message from `sender` to `receiver` to read.
    /// Returns how many rows changed.
    fn mark_read(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// One summary per counterpart of `user`, most recently active first.
    fn get_conversation_summaries(
        &self,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummary>, StoreError>> + Send;

    /// Look up a known user.
    fn get_user(
        &self,
        id: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<UserProfile>, StoreError>> + Send;

    /// Record or refresh a user's identity fields.
    fn upsert_user(
        &self,
        profile: &UserProfile,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// Makes `users` known to `store`, using the bare id as display name.
///
/// Users already present keep their stored profile. Returns how many were
/// inserted.
///
/// # Errors
///
/// Returns the first store error encountered.
pub async fn seed_missing_users<'a, S: MessageStore>(
    store: &S,
    users: impl IntoIterator<Item = &'a UserId>,
) -> Result<usize, StoreError> {
    let mut inserted = 0;
    for user in users {
        if store.get_user(user).await?.is_some() {
            continue;
        }
        store
            .upsert_user(&UserProfile::new(user.clone(), user.as_str()))
            .await?;
        inserted += 1;
    }
    Ok(inserted)
}

/// A stored message with its insertion sequence number.
#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: ChatMessage,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    messages: Vec<StoredMessage>,
    users: HashMap<UserId, UserProfile>,
}

/// In-memory [`MessageStore`] with fault injection for tests.
///
/// Messages are kept in insertion order; the sequence number breaks ties
/// between messages created within the same millisecond.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_history: AtomicBool,
}

impl InMemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given users.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        let mut store = Self::new();
        {
            let state = store.state.get_mut();
            for profile in users {
                state.users.insert(profile.id.clone(), profile);
            }
        }
        store
    }

    /// While set, `create_message` and `mark_read` fail with
    /// [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// While set, every read (history, summaries and user lookups) fails
    /// with [`StoreError::Unavailable`].
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// While set, only `get_history` fails with [`StoreError::Unavailable`];
    /// user lookups still succeed.
    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Total number of persisted messages.
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write fault".into()));
        }
        Ok(())
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read fault".into()));
        }
        Ok(())
    }
}

impl MessageStore for InMemoryStore {
    async fn create_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        self.check_writes()?;
        let mut state = self.state.lock().await;
        let message = ChatMessage {
            id: MessageId::new(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.to_string(),
            created_at: Timestamp::now(),
            read: false,
        };
        state.next_seq += 1;
        let seq = state.next_seq;
        state.messages.push(StoredMessage {
            seq,
            message: message.clone(),
        });
        drop(state);
        Ok(message)
    }

    async fn get_history(
        &self,
        a: &UserId,
        b: &UserId,
        cursor: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check_reads()?;
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected history fault".into()));
        }
        let key = ConversationKey::new(a.clone(), b.clone());
        let state = self.state.lock().await;

        let before_seq = match cursor {
            Some(HistoryCursor::BeforeMessageId(id)) => Some(
                state
                    .messages
                    .iter()
                    .find(|m| m.message.id == id && key.includes(&m.message))
                    .map(|m| m.seq)
                    .ok_or_else(|| StoreError::NotFound(format!("message {id} in {key}")))?,
            ),
            _ => None,
        };
        let before_ts = match cursor {
            Some(HistoryCursor::BeforeTimestamp(ts)) => Some(ts),
            _ => None,
        };

        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| key.includes(&m.message))
            .filter(|m| before_seq.is_none_or(|seq| m.seq < seq))
            .filter(|m| before_ts.is_none_or(|ts| m.message.created_at < ts))
            .take(limit)
            .map(|m| m.message.clone())
            .collect())
    }

    async fn mark_read(&self, sender: &UserId, receiver: &UserId) -> Result<u64, StoreError> {
        self.check_writes()?;
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for stored in &mut state.messages {
            let m = &mut stored.message;
            if !m.read && &m.sender_id == sender && &m.receiver_id == receiver {
                m.read = true;
                updated += 1;
            }
        }
        drop(state);
        Ok(updated)
    }

    async fn get_conversation_summaries(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        self.check_reads()?;
        let state = self.state.lock().await;

        // peer -> (last seq, last message, unread)
        let mut by_peer: HashMap<&UserId, (u64, &ChatMessage, u32)> = HashMap::new();
        for stored in &state.messages {
            let Some(peer) = stored.message.counterpart(user) else {
                continue;
            };
            let unread = u32::from(!stored.message.read && &stored.message.receiver_id == user);
            by_peer
                .entry(peer)
                .and_modify(|(seq, last, count)| {
                    *seq = stored.seq;
                    *last = &stored.message;
                    *count += unread;
                })
                .or_insert((stored.seq, &stored.message, unread));
        }

        let mut rows: Vec<_> = by_peer.into_iter().collect();
        rows.sort_by(|a, b| b.1.0.cmp(&a.1.0));

        Ok(rows
            .into_iter()
            .map(|(peer, (_, last, unread_count))| ConversationSummary {
                peer: state
                    .users
                    .get(peer)
                    .cloned()
                    .unwrap_or_else(|| UserProfile::new(peer.clone(), peer.as_str())),
                last_message: last.clone(),
                unread_count,
            })
            .collect())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        self.check_reads()?;
        Ok(self.state.lock().await.users.get(id).cloned())
    }

    async fn upsert_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .users
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}
