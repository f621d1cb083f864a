//! SQLite-backed [`MessageStore`].
//!
//! One connection behind a mutex, WAL journal, schema applied on open.
//! Every call runs on the blocking pool so store I/O never stalls the
//! runtime. Messages carry an autoincrement `seq` that orders history and
//! breaks ties between messages created in the same millisecond.

use std::path::Path;
use std::sync::{Arc, Mutex};

use murmur_proto::message::{
    ChatMessage, ConversationKey, ConversationSummary, HistoryCursor, MessageId, Timestamp, UserId,
    UserProfile,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::store::{MessageStore, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id            TEXT PRIMARY KEY,
        display_name  TEXT NOT NULL,
        avatar        TEXT
    );

    CREATE TABLE IF NOT EXISTS messages (
        seq          INTEGER PRIMARY KEY AUTOINCREMENT,
        id           TEXT NOT NULL UNIQUE,
        sender_id    TEXT NOT NULL,
        receiver_id  TEXT NOT NULL,
        pair_low     TEXT NOT NULL,
        pair_high    TEXT NOT NULL,
        content      TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        read         INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_messages_pair
        ON messages(pair_low, pair_high, seq);

    CREATE INDEX IF NOT EXISTS idx_messages_unread
        ON messages(receiver_id, sender_id) WHERE read = 0;
";

const MESSAGE_COLUMNS: &str = "messages.id, messages.sender_id, messages.receiver_id, \
                               messages.content, messages.created_at, messages.read";

/// Durable store over a single SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        let store = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "message database opened");
        Ok(store)
    }

    /// Opens a private in-memory database; used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn read_failed(e: rusqlite::Error) -> StoreError {
    StoreError::ReadFailed(e.to_string())
}

fn write_failed(e: rusqlite::Error) -> StoreError {
    StoreError::WriteFailed(e.to_string())
}

fn to_sql_millis(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: String = row.get(0)?;
    let uuid = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: i64 = row.get(4)?;
    Ok(ChatMessage {
        id: MessageId::from_uuid(uuid),
        sender_id: UserId::new(row.get::<_, String>(1)?),
        receiver_id: UserId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at: Timestamp::from_millis(u64::try_from(created_at).unwrap_or_default()),
        read: row.get(5)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: UserId::new(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        avatar: row.get(2)?,
    })
}

impl MessageStore for SqliteStore {
    async fn create_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: MessageId::new(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.to_string(),
            created_at: Timestamp::now(),
            read: false,
        };
        let row = message.clone();
        self.with_conn(move |conn| {
            let key = row.conversation();
            let (low, high) = key.participants();
            conn.execute(
                "INSERT INTO messages
                    (id, sender_id, receiver_id, pair_low, pair_high, content, created_at, read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    row.id.to_string(),
                    row.sender_id.as_str(),
                    row.receiver_id.as_str(),
                    low.as_str(),
                    high.as_str(),
                    row.content,
                    to_sql_millis(row.created_at),
                ],
            )
            .map_err(write_failed)?;
            Ok(())
        })
        .await?;
        Ok(message)
    }

    async fn get_history(
        &self,
        a: &UserId,
        b: &UserId,
        cursor: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let key = ConversationKey::new(a.clone(), b.clone());
        self.with_conn(move |conn| {
            let (low, high) = key.participants();
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);

            let before_seq = match cursor {
                Some(HistoryCursor::BeforeMessageId(id)) => conn
                    .query_row(
                        "SELECT seq FROM messages
                         WHERE id = ?1 AND pair_low = ?2 AND pair_high = ?3",
                        params![id.to_string(), low.as_str(), high.as_str()],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()
                    .map_err(read_failed)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {id} in {key}")))?,
                _ => i64::MAX,
            };
            let before_ts = match cursor {
                Some(HistoryCursor::BeforeTimestamp(ts)) => to_sql_millis(ts),
                _ => i64::MAX,
            };

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE pair_low = ?1 AND pair_high = ?2 AND seq < ?3 AND created_at < ?4
                     ORDER BY seq DESC
                     LIMIT ?5"
                ))
                .map_err(read_failed)?;
            let rows = stmt
                .query_map(
                    params![low.as_str(), high.as_str(), before_seq, before_ts, limit],
                    message_from_row,
                )
                .map_err(read_failed)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(read_failed)
        })
        .await
    }

    async fn mark_read(&self, sender: &UserId, receiver: &UserId) -> Result<u64, StoreError> {
        let sender = sender.clone();
        let receiver = receiver.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE messages SET read = 1
                     WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
                    params![sender.as_str(), receiver.as_str()],
                )
                .map_err(write_failed)?;
            Ok(u64::try_from(changed).unwrap_or(u64::MAX))
        })
        .await
    }

    async fn get_conversation_summaries(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "WITH mine AS (
                        SELECT *,
                               CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS peer
                        FROM messages
                        WHERE sender_id = ?1 OR receiver_id = ?1
                     ),
                     latest AS (
                        SELECT peer, MAX(seq) AS last_seq,
                               SUM(CASE WHEN receiver_id = ?1 AND read = 0 THEN 1 ELSE 0 END) AS unread
                        FROM mine GROUP BY peer
                     )
                     SELECT {MESSAGE_COLUMNS}, latest.unread,
                            users.id, users.display_name, users.avatar, latest.peer
                     FROM latest
                     JOIN messages ON messages.seq = latest.last_seq
                     LEFT JOIN users ON users.id = latest.peer
                     ORDER BY latest.last_seq DESC"
                ))
                .map_err(read_failed)?;
            let rows = stmt
                .query_map(params![user.as_str()], |row| {
                    let last_message = message_from_row(row)?;
                    let unread: i64 = row.get(6)?;
                    let peer_id: String = row.get(10)?;
                    let display_name: Option<String> = row.get(8)?;
                    let peer = UserProfile {
                        display_name: display_name.unwrap_or_else(|| peer_id.clone()),
                        avatar: row.get(9)?,
                        id: UserId::new(peer_id),
                    };
                    Ok(ConversationSummary {
                        peer,
                        last_message,
                        unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
                    })
                })
                .map_err(read_failed)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(read_failed)
        })
        .await
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, display_name, avatar FROM users WHERE id = ?1",
                params![id.as_str()],
                profile_from_row,
            )
            .optional()
            .map_err(read_failed)
        })
        .await
    }

    async fn upsert_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let profile = profile.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, avatar) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar = excluded.avatar",
                params![profile.id.as_str(), profile.display_name, profile.avatar],
            )
            .map_err(write_failed)?;
            Ok(())
        })
        .await
    }
}
