//! Presence registry: which users are online and through which sessions.
//!
//! A user is online while at least one session is registered for them.
//! Each session is reachable through the sender half of its bounded
//! outbound queue; the gateway's writer task drains the other half to the
//! socket. Delivery never blocks. A closed queue prunes the stale handle; a
//! full queue prunes the handle and signals the session's eviction, so the
//! gateway closes that connection and the client recovers through history
//! on reconnect instead of silently missing a live event.
//!
//! The map is split into a fixed number of shards keyed by user-id hash so
//! fan-out to unrelated users does not contend on a single lock. Shard locks
//! are synchronous and never held across an `.await`.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use murmur_proto::event::ServerFrame;
use murmur_proto::message::UserId;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Number of lock stripes.
const SHARD_COUNT: usize = 16;

/// Unique identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocates a fresh session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry-side handle to a session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::Sender<ServerFrame>,
    eviction: Arc<Notify>,
}

impl SessionHandle {
    /// Wraps the sender half of a session's outbound queue. `eviction` is
    /// notified if the registry drops the session for falling behind.
    #[must_use]
    pub const fn new(
        id: SessionId,
        outbound: mpsc::Sender<ServerFrame>,
        eviction: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            outbound,
            eviction,
        }
    }

    /// The session this handle delivers to.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }
}

type Shard = HashMap<UserId, HashMap<SessionId, SessionHandle>>;

/// Mapping from user identity to that user's live sessions.
pub struct PresenceRegistry {
    shards: Vec<Mutex<Shard>>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, user: &UserId) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        // Truncation is fine, only the low bits pick the shard.
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.shards.len();
        &self.shards[index]
    }

    /// Adds `handle` to `user`'s session set. Re-registering the same
    /// session replaces its handle.
    ///
    /// Returns `true` if the user just came online.
    pub fn register(&self, user: &UserId, handle: SessionHandle) -> bool {
        let session_id = handle.id;
        let mut shard = self.shard(user).lock();
        let sessions = shard.entry(user.clone()).or_default();
        let came_online = sessions.is_empty();
        sessions.insert(session_id, handle);
        let count = sessions.len();
        drop(shard);

        if came_online {
            tracing::info!(user_id = %user, session_id = %session_id, "user online");
        } else {
            tracing::debug!(user_id = %user, session_id = %session_id, sessions = count, "additional session registered");
        }
        came_online
    }

    /// Removes one session. Unknown sessions are ignored.
    ///
    /// Returns `true` if the user just went offline.
    pub fn unregister(&self, user: &UserId, session_id: SessionId) -> bool {
        let mut shard = self.shard(user).lock();
        let Some(sessions) = shard.get_mut(user) else {
            return false;
        };
        if sessions.remove(&session_id).is_none() {
            return false;
        }
        let went_offline = sessions.is_empty();
        if went_offline {
            shard.remove(user);
        }
        drop(shard);

        if went_offline {
            tracing::info!(user_id = %user, session_id = %session_id, "user offline");
        }
        went_offline
    }

    /// Enqueues `frame` to every live session of `user`.
    ///
    /// Returns how many sessions accepted the frame. With no sessions the
    /// frame is dropped; history replay is the recovery path. A session
    /// whose queue is full is evicted rather than left registered with a
    /// gap in its live stream.
    pub fn deliver_to_user(&self, user: &UserId, frame: &ServerFrame) -> usize {
        let mut shard = self.shard(user).lock();
        let Some(sessions) = shard.get_mut(user) else {
            return 0;
        };

        let mut delivered = 0;
        sessions.retain(|session_id, handle| match handle.outbound.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %user,
                    session_id = %session_id,
                    event = frame.event.name(),
                    "outbound queue full, evicting session"
                );
                handle.eviction.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %user, session_id = %session_id, "pruning stale session");
                false
            }
        });
        if sessions.is_empty() {
            shard.remove(user);
            drop(shard);
            tracing::info!(user_id = %user, "user offline (all sessions stale)");
        }
        delivered
    }

    /// Returns `true` if `user` has at least one registered session.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.session_count(user) > 0
    }

    /// Number of registered sessions for `user`.
    #[must_use]
    pub fn session_count(&self, user: &UserId) -> usize {
        self.shard(user).lock().get(user).map_or(0, HashMap::len)
    }

    /// Number of users with at least one session.
    #[must_use]
    pub fn online_user_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
