//! Per-connection session state.
//!
//! A [`Session`] exists only after authentication succeeded. It is owned by
//! the connection's reader loop, which processes inbound frames one at a
//! time, so session state is never shared between tasks. Typing timers are
//! the only spawned work a session owns; they are aborted when the session
//! leaves the conversation or disconnects.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_proto::event::ServerFrame;
use murmur_proto::message::{UserId, UserProfile};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::presence::{SessionHandle, SessionId};

/// Lifecycle position of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Authenticated, no conversation open.
    Idle,
    /// A conversation with the given peer is open.
    InConversation(UserId),
    /// Disconnected; cleanup has run.
    Closed,
}

/// One authenticated client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user: UserProfile,
    outbound: mpsc::Sender<ServerFrame>,
    eviction: Arc<Notify>,
    current_peer: Option<UserId>,
    typing: HashMap<UserId, JoinHandle<()>>,
    closed: bool,
}

impl Session {
    /// Creates a session for a verified identity.
    #[must_use]
    pub fn new(user: UserProfile, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id: SessionId::new(),
            user,
            outbound,
            eviction: Arc::new(Notify::new()),
            current_peer: None,
            typing: HashMap::new(),
            closed: false,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The authenticated user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user.id
    }

    /// The authenticated user's profile.
    #[must_use]
    pub const fn profile(&self) -> &UserProfile {
        &self.user
    }

    /// Counterpart of the open conversation, if any.
    #[must_use]
    pub const fn current_peer(&self) -> Option<&UserId> {
        self.current_peer.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else {
            self.current_peer
                .clone()
                .map_or(SessionState::Idle, SessionState::InConversation)
        }
    }

    /// Returns `true` once disconnect cleanup has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// A registry handle delivering into this session's outbound queue.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.id, self.outbound.clone(), Arc::clone(&self.eviction))
    }

    /// Notified when the presence registry evicts this session for letting
    /// its outbound queue fill up. The connection should then be closed.
    #[must_use]
    pub fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.eviction)
    }

    /// Queues a frame for this session's socket, waiting for room if the
    /// queue is full. Returns `false` if the writer has gone away.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Returns `true` while a typing indicator toward `peer` is live.
    #[must_use]
    pub fn is_typing_to(&self, peer: &UserId) -> bool {
        self.typing.get(peer).is_some_and(|timer| !timer.is_finished())
    }

    pub(crate) fn set_current_peer(&mut self, peer: UserId) {
        self.current_peer = Some(peer);
    }

    pub(crate) const fn take_current_peer(&mut self) -> Option<UserId> {
        self.current_peer.take()
    }

    /// Installs the expiry timer for `peer`, aborting any previous one.
    pub(crate) fn arm_typing(&mut self, peer: UserId, timer: JoinHandle<()>) {
        self.typing.retain(|_, t| !t.is_finished());
        if let Some(previous) = self.typing.insert(peer, timer) {
            previous.abort();
        }
    }

    /// Aborts the timer for `peer`. Returns `true` if it was still live.
    pub(crate) fn cancel_typing(&mut self, peer: &UserId) -> bool {
        self.typing.remove(peer).is_some_and(|timer| {
            let live = !timer.is_finished();
            timer.abort();
            live
        })
    }

    /// Aborts every timer and returns the peers whose indicator was live.
    pub(crate) fn cancel_all_typing(&mut self) -> Vec<UserId> {
        self.typing
            .drain()
            .filter_map(|(peer, timer)| {
                let live = !timer.is_finished();
                timer.abort();
                live.then_some(peer)
            })
            .collect()
    }

    /// Marks the session closed. Returns `false` if it already was.
    pub(crate) const fn mark_closed(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for timer in self.typing.values() {
            timer.abort();
        }
    }
}
