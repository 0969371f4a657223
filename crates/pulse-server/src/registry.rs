//! Process-wide map of online users to their live connection.
//!
//! At most one connection per user: registering a new one closes the old one
//! with [`CLOSE_SUPERSEDED`]. Removal is by identity, so a superseded socket
//! that finishes closing late cannot evict its replacement.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use pulse_shared::constants::CLOSE_SUPERSEDED;
use pulse_shared::protocol::OutboundFrame;
use pulse_shared::types::{ConversationId, PresenceState, UserId};

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// What the writer task should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Arc<str>),
    Close(CloseReason),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("connection is closed")]
pub struct ConnectionClosed;

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Arc<str>>,
    closed: Option<CloseReason>,
}

/// Bounded frame queue drained by one writer. When full, the oldest frame is
/// dropped so a slow reader never blocks the sender.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is a plain buffer; a panic mid-push leaves it usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, frame: Arc<str>) -> Result<(), ConnectionClosed> {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return Err(ConnectionClosed);
            }
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.frames.push_back(frame);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Refuse further frames. Already queued frames are still flushed before
    /// the writer sees the close. The first close wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(CloseReason {
                code,
                reason: reason.into(),
            });
        }
        self.ready.notify_one();
    }

    pub async fn next(&self) -> Outgoing {
        loop {
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Outgoing::Frame(frame);
                }
                if let Some(reason) = &state.closed {
                    return Outgoing::Close(reason.clone());
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take every queued frame without waiting.
    #[cfg(test)]
    pub fn drain_frames(&self) -> Vec<Arc<str>> {
        self.lock().frames.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Presence {
    state: PresenceState,
    active_conversation: Option<ConversationId>,
}

/// One authenticated socket, shared between its read loop, its writer task
/// and the registry.
pub struct ConnectionHandle {
    id: Uuid,
    user_id: UserId,
    presence: Mutex<Presence>,
    last_seen: Mutex<Instant>,
    queue: OutboundQueue,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            presence: Mutex::new(Presence {
                state: PresenceState::Foreground,
                active_conversation: None,
            }),
            last_seen: Mutex::new(Instant::now()),
            queue: OutboundQueue::new(queue_capacity),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn presence_guard(&self) -> MutexGuard<'_, Presence> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn presence(&self) -> PresenceState {
        self.presence_guard().state
    }

    pub fn set_presence(&self, state: PresenceState) {
        self.presence_guard().state = state;
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.presence_guard().active_conversation
    }

    pub fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        self.presence_guard().active_conversation = conversation_id;
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Queue pre-serialized text. Fails once the connection is closed.
    pub fn send_text(&self, text: Arc<str>) -> Result<(), ConnectionClosed> {
        self.queue.push(text)
    }

    pub fn send(&self, frame: &OutboundFrame) -> Result<(), ConnectionClosed> {
        match frame.to_json() {
            Ok(json) => self.send_text(json.into()),
            Err(e) => {
                tracing::error!(error = %e, user = %self.user_id, "Failed to encode frame");
                Ok(())
            }
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.queue.close(code, reason);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Sharded concurrent map; operations on one user id are linearizable,
/// different users never contend on a global lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `conn` as the user's connection. A previous connection is closed
    /// with [`CLOSE_SUPERSEDED`] and returned.
    pub fn register(&self, conn: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let user_id = conn.user_id();
        let previous = self.connections.insert(user_id, conn);
        if let Some(old) = &previous {
            old.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
            info!(user = %user_id, old = %old.id(), "Connection superseded");
        }
        previous
    }

    /// Remove the user's entry only if it is still `connection_id`.
    pub fn unregister(&self, user_id: UserId, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, conn| conn.id() == connection_id)
            .is_some();
        if removed {
            debug!(user = %user_id, conn = %connection_id, "Connection unregistered");
        }
        removed
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&user_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn set_active_conversation(
        &self,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
    ) -> bool {
        match self.connections.get(&user_id) {
            Some(conn) => {
                conn.set_active_conversation(conversation_id);
                true
            }
            None => false,
        }
    }

    pub fn set_presence(&self, user_id: UserId, state: PresenceState) -> bool {
        match self.connections.get(&user_id) {
            Some(conn) => {
                conn.set_presence(state);
                true
            }
            None => false,
        }
    }

    /// Snapshot of connections silent for at least `threshold`.
    pub fn idle_connections(&self, threshold: Duration) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().idle_for() >= threshold)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = OutboundQueue::new(2);
        queue.push("a".into()).unwrap();
        queue.push("b".into()).unwrap();
        queue.push("c".into()).unwrap();

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.next().await, Outgoing::Frame("b".into()));
        assert_eq!(queue.next().await, Outgoing::Frame("c".into()));
    }

    #[tokio::test]
    async fn test_queue_flushes_then_closes() {
        let queue = OutboundQueue::new(8);
        queue.push("last words".into()).unwrap();
        queue.close(4000, "bye");
        queue.close(4002, "ignored");

        assert_eq!(queue.push("late".into()), Err(ConnectionClosed));
        assert_eq!(queue.next().await, Outgoing::Frame("last words".into()));
        assert_eq!(
            queue.next().await,
            Outgoing::Close(CloseReason {
                code: 4000,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn test_writer_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(8));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.push("ping".into()).unwrap();
        assert_eq!(reader.await.unwrap(), Outgoing::Frame("ping".into()));
    }

    #[test]
    fn test_register_supersedes_previous() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let first = ConnectionHandle::new(user, 8);
        let second = ConnectionHandle::new(user, 8);

        assert!(registry.register(Arc::clone(&first)).is_none());
        let replaced = registry.register(Arc::clone(&second)).unwrap();

        assert_eq!(replaced.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(user).unwrap().id(), second.id());
    }

    #[test]
    fn test_late_unregister_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let first = ConnectionHandle::new(user, 8);
        let second = ConnectionHandle::new(user, 8);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        assert!(!registry.unregister(user, first.id()));
        assert!(registry.is_online(user));
        assert!(registry.unregister(user, second.id()));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_active_conversation() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let conv = ConversationId::new();
        assert!(!registry.set_active_conversation(user, Some(conv)));

        registry.register(ConnectionHandle::new(user, 8));
        assert!(registry.set_active_conversation(user, Some(conv)));
        assert_eq!(registry.get(user).unwrap().active_conversation(), Some(conv));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections() {
        let registry = ConnectionRegistry::new();
        let quiet = ConnectionHandle::new(UserId::new(), 8);
        let chatty = ConnectionHandle::new(UserId::new(), 8);
        registry.register(Arc::clone(&quiet));
        registry.register(Arc::clone(&chatty));

        tokio::time::advance(Duration::from_secs(60)).await;
        chatty.touch();

        let idle = registry.idle_connections(Duration::from_secs(30));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id(), quiet.id());
    }

    #[test]
    fn test_concurrent_register_unregister_same_user() {
        let registry = Arc::new(ConnectionRegistry::new());
        let user = UserId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let conn = ConnectionHandle::new(user, 4);
                        registry.register(Arc::clone(&conn));
                        registry.unregister(user, conn.id());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever is left must be a live, unclosed connection.
        if let Some(conn) = registry.get(user) {
            assert!(!conn.is_closed());
        }
    }
}
