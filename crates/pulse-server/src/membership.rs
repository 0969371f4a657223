//! Three-tier membership lookup: process-local map, shared cache, store.
//!
//! Local entries live for a random TTL between the configured bounds so keys
//! filled together do not all expire together. Invalidations are published
//! on the shared tier's bus and every [`MembershipCache`] listening on it
//! evicts its local copy, so one process's membership change reaches the
//! whole fleet.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use pulse_shared::types::{ConversationId, UserId};

use crate::store::MembershipSource;

// ---------------------------------------------------------------------------
// Shared tier
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("shared cache unavailable: {0}")]
    Unavailable(String),
}

/// Broadcast to every process when a conversation's membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub conversation_id: ConversationId,
    /// Users whose conversation lists are affected.
    pub user_ids: Vec<UserId>,
}

/// What listeners on the shared bus receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSignal {
    Invalidated(Invalidation),
    /// Invalidations may have been missed; drop every local entry.
    Resync,
}

/// Versioned set storage with expiry plus a pub/sub channel, the shape of a
/// Redis deployment.
///
/// Every `delete` bumps the version of each key it touches. A loader reads
/// the version before going to the store and writes back with
/// [`put_set_if_unchanged`](SharedCache::put_set_if_unchanged), so a result
/// that an invalidation overtook is never stored.
#[async_trait]
pub trait SharedCache: Send + Sync + 'static {
    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheError>;
    async fn version(&self, key: &str) -> Result<u64, CacheError>;
    /// `Ok(false)` when `key` was deleted after `seen_version` was read.
    async fn put_set_if_unchanged(
        &self,
        key: &str,
        members: Vec<String>,
        ttl: Duration,
        seen_version: u64,
    ) -> Result<bool, CacheError>;
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
    async fn publish(&self, event: Invalidation) -> Result<(), CacheError>;
    fn subscribe(&self) -> broadcast::Receiver<CacheSignal>;
}

/// Single-node shared tier. Several caches holding the same instance behave
/// like several processes sharing one cache server.
pub struct InMemorySharedCache {
    sets: DashMap<String, (Vec<String>, Instant)>,
    versions: DashMap<String, u64>,
    bus: broadcast::Sender<CacheSignal>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            sets: DashMap::new(),
            versions: DashMap::new(),
            bus,
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheError> {
        let now = Instant::now();
        let hit = self
            .sets
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.sets.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(hit)
    }

    async fn version(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.versions.get(key).map(|v| *v).unwrap_or(0))
    }

    async fn put_set_if_unchanged(
        &self,
        key: &str,
        members: Vec<String>,
        ttl: Duration,
        seen_version: u64,
    ) -> Result<bool, CacheError> {
        // Holding the version entry keeps a concurrent delete out until the
        // set is in place, so the delete removes it afterwards.
        let version = self.versions.entry(key.to_string()).or_insert(0);
        if *version != seen_version {
            return Ok(false);
        }
        self.sets.insert(key.to_string(), (members, Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            *self.versions.entry(key.clone()).or_insert(0) += 1;
            self.sets.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, event: Invalidation) -> Result<(), CacheError> {
        // No subscribers is not an error: nothing is cached anywhere.
        let _ = self.bus.send(CacheSignal::Invalidated(event));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheSignal> {
        self.bus.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Members(ConversationId),
    Conversations(UserId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Members(id) => write!(f, "pulse:members:{id}"),
            Self::Conversations(id) => write!(f, "pulse:conversations:{id}"),
        }
    }
}

struct LocalEntry<T> {
    values: HashSet<T>,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// Membership cache
// ---------------------------------------------------------------------------

pub struct MembershipCache {
    members: DashMap<ConversationId, LocalEntry<UserId>>,
    conversations: DashMap<UserId, LocalEntry<ConversationId>>,
    /// Bumped on every local eviction of the key.
    generations: DashMap<CacheKey, u64>,
    shared: Arc<dyn SharedCache>,
    source: Arc<dyn MembershipSource>,
    ttl_min: Duration,
    ttl_max: Duration,
}

impl MembershipCache {
    pub fn new(
        source: Arc<dyn MembershipSource>,
        shared: Arc<dyn SharedCache>,
        ttl_min: Duration,
        ttl_max: Duration,
    ) -> Self {
        Self {
            members: DashMap::new(),
            conversations: DashMap::new(),
            generations: DashMap::new(),
            shared,
            source,
            ttl_min: ttl_min.min(ttl_max),
            ttl_max: ttl_max.max(ttl_min),
        }
    }

    /// Members of a conversation. Empty when the store is unreachable.
    pub async fn get_members(&self, conversation_id: ConversationId) -> HashSet<UserId> {
        let key = CacheKey::Members(conversation_id);
        self.lookup(&self.members, conversation_id, key, || {
            self.source.conversation_members(conversation_id)
        })
        .await
    }

    /// Conversations a user belongs to. Empty when the store is unreachable.
    pub async fn get_conversations(&self, user_id: UserId) -> HashSet<ConversationId> {
        let key = CacheKey::Conversations(user_id);
        self.lookup(&self.conversations, user_id, key, || {
            self.source.user_conversations(user_id)
        })
        .await
    }

    pub async fn is_member(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.get_members(conversation_id).await.contains(&user_id)
    }

    /// Local tier, then shared tier, then `load`. A load that an
    /// invalidation overtook is returned to this caller but cached nowhere.
    async fn lookup<K, T, F, Fut>(
        &self,
        local: &DashMap<K, LocalEntry<T>>,
        id: K,
        key: CacheKey,
        load: F,
    ) -> HashSet<T>
    where
        K: Eq + Hash + Copy,
        T: Eq + Hash + Copy + fmt::Display + FromStr,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = pulse_store::Result<Vec<T>>>,
    {
        let generation = self.generation(key);
        let now = Instant::now();
        if let Some(entry) = local.get(&id) {
            if entry.expires_at > now {
                return entry.values.clone();
            }
        }

        let key_str = key.to_string();
        match self.shared.get_set(&key_str).await {
            Ok(Some(raw)) => {
                let values: HashSet<T> = raw.iter().filter_map(|s| s.parse().ok()).collect();
                self.fill_local(local, id, key, generation, values.clone());
                return values;
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key_str, error = %e, "Shared cache read failed"),
        }

        let shared_version = match self.shared.version(&key_str).await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(key = %key_str, error = %e, "Shared cache version read failed");
                None
            }
        };

        let values: HashSet<T> = match load().await {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => {
                warn!(key = %key_str, error = %e, "Membership load failed, treating as empty");
                return HashSet::new();
            }
        };
        debug!(key = %key_str, count = values.len(), "Membership loaded from store");

        let current = match shared_version {
            Some(seen) => {
                let raw: Vec<String> = values.iter().map(ToString::to_string).collect();
                match self
                    .shared
                    .put_set_if_unchanged(&key_str, raw, self.ttl_max, seen)
                    .await
                {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(key = %key_str, error = %e, "Shared cache write failed");
                        true
                    }
                }
            }
            None => true,
        };

        if current {
            self.fill_local(local, id, key, generation, values.clone());
        } else {
            debug!(key = %key_str, "Membership changed during load, not cached");
        }
        values
    }

    fn generation(&self, key: CacheKey) -> u64 {
        *self.generations.entry(key).or_insert(0)
    }

    fn bump_generation(&self, key: CacheKey) {
        *self.generations.entry(key).or_insert(0) += 1;
    }

    /// Insert unless `key` was evicted since `seen_generation` was read. The
    /// generation entry stays locked across the insert so an eviction
    /// either lands first and wins, or waits and removes the new entry.
    fn fill_local<K: Eq + Hash, T>(
        &self,
        local: &DashMap<K, LocalEntry<T>>,
        id: K,
        key: CacheKey,
        seen_generation: u64,
        values: HashSet<T>,
    ) {
        let Some(generation) = self.generations.get(&key) else {
            return;
        };
        if *generation != seen_generation {
            return;
        }
        local.insert(
            id,
            LocalEntry {
                values,
                expires_at: Instant::now() + self.random_ttl(),
            },
        );
    }

    fn random_ttl(&self) -> Duration {
        let min = self.ttl_min.as_millis() as u64;
        let max = self.ttl_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Drop every cached view of a conversation's membership across the
    /// fleet: the members set plus the conversation lists of every user
    /// known to be in it.
    pub async fn invalidate(&self, conversation_id: ConversationId) {
        self.invalidate_with(conversation_id, &[]).await;
    }

    /// Like [`invalidate`](Self::invalidate), also covering users that just
    /// joined or left and may not appear in any cached member set.
    pub async fn invalidate_with(&self, conversation_id: ConversationId, changed: &[UserId]) {
        let mut users: HashSet<UserId> = changed.iter().copied().collect();
        if let Some(entry) = self.members.get(&conversation_id) {
            users.extend(entry.values.iter().copied());
        }
        let members_key = CacheKey::Members(conversation_id).to_string();
        if let Ok(Some(raw)) = self.shared.get_set(&members_key).await {
            users.extend(raw.iter().filter_map(|s| s.parse::<UserId>().ok()));
        }

        let event = Invalidation {
            conversation_id,
            user_ids: users.into_iter().collect(),
        };

        let mut keys = vec![members_key];
        keys.extend(
            event
                .user_ids
                .iter()
                .map(|u| CacheKey::Conversations(*u).to_string()),
        );
        if let Err(e) = self.shared.delete(&keys).await {
            warn!(conversation = %conversation_id, error = %e, "Shared cache delete failed");
        }

        // Evict here too, so this process is consistent before its own
        // listener sees the event.
        self.evict(&event);

        if let Err(e) = self.shared.publish(event).await {
            warn!(conversation = %conversation_id, error = %e, "Invalidation publish failed");
        }
    }

    fn evict(&self, event: &Invalidation) {
        self.bump_generation(CacheKey::Members(event.conversation_id));
        self.members.remove(&event.conversation_id);
        for user in &event.user_ids {
            self.bump_generation(CacheKey::Conversations(*user));
            self.conversations.remove(user);
        }
    }

    fn clear_local(&self) {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.members.clear();
        self.conversations.clear();
    }

    /// Evict the local tier on every invalidation published on the shared
    /// bus. Subscribes before returning, so no later event is missed.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.shared.subscribe();
        let cache: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(cache) = cache.upgrade() else { break };
                match event {
                    Ok(CacheSignal::Invalidated(event)) => {
                        debug!(conversation = %event.conversation_id, "Membership invalidated");
                        cache.evict(&event);
                    }
                    Ok(CacheSignal::Resync) => {
                        debug!("Shared bus resynced, clearing local cache");
                        cache.clear_local();
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Invalidation listener lagged, clearing local cache");
                        cache.clear_local();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    #[cfg(test)]
    fn has_local_members(&self, conversation_id: ConversationId) -> bool {
        self.members.contains_key(&conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use pulse_store::StoreError;
    use tokio::sync::Notify;

    /// In-test membership table with a call counter and a failure switch.
    /// With a gate set, member loads read the table and then wait for the
    /// gate before returning.
    #[derive(Default)]
    struct FakeSource {
        members: Mutex<HashMap<ConversationId, Vec<UserId>>>,
        loads: AtomicUsize,
        failing: AtomicBool,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl FakeSource {
        fn set(&self, conv: ConversationId, users: Vec<UserId>) {
            self.members.lock().unwrap().insert(conv, users);
        }
    }

    #[async_trait]
    impl MembershipSource for FakeSource {
        async fn conversation_members(
            &self,
            conversation_id: ConversationId,
        ) -> pulse_store::Result<Vec<UserId>> {
            if self.failing.load(Ordering::SeqCst) {
                self.loads.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("down".into()));
            }
            let snapshot = self
                .members
                .lock()
                .unwrap()
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            self.loads.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(snapshot)
        }

        async fn user_conversations(
            &self,
            user_id: UserId,
        ) -> pulse_store::Result<Vec<ConversationId>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".into()));
            }
            Ok(self
                .members
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, users)| users.contains(&user_id))
                .map(|(conv, _)| *conv)
                .collect())
        }
    }

    fn cache_over(source: &Arc<FakeSource>, shared: &Arc<InMemorySharedCache>) -> Arc<MembershipCache> {
        Arc::new(MembershipCache::new(
            Arc::clone(source) as Arc<dyn MembershipSource>,
            Arc::clone(shared) as Arc<dyn SharedCache>,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn test_local_tier_absorbs_repeat_lookups() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        let (a, b) = (UserId::new(), UserId::new());
        source.set(conv, vec![a, b]);
        let cache = cache_over(&source, &shared);

        assert_eq!(cache.get_members(conv).await, HashSet::from([a, b]));
        assert_eq!(cache.get_members(conv).await.len(), 2);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_tier_serves_second_process() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        source.set(conv, vec![UserId::new()]);

        let first = cache_over(&source, &shared);
        let second = cache_over(&source, &shared);
        first.get_members(conv).await;
        second.get_members(conv).await;

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_failure_yields_empty_set() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        source.set(conv, vec![UserId::new()]);
        source.failing.store(true, Ordering::SeqCst);
        let cache = cache_over(&source, &shared);

        assert!(cache.get_members(conv).await.is_empty());

        // The failure is not cached.
        source.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.get_members(conv).await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_reaches_other_instances() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        source.set(conv, vec![a, b]);

        let writer = cache_over(&source, &shared);
        let reader = cache_over(&source, &shared);
        writer.spawn_invalidation_listener();
        reader.spawn_invalidation_listener();

        assert_eq!(reader.get_members(conv).await, HashSet::from([a, b]));
        assert_eq!(reader.get_conversations(a).await, HashSet::from([conv]));

        // Membership changes behind both caches.
        source.set(conv, vec![a, c]);
        writer.invalidate_with(conv, &[c]).await;

        for _ in 0..10 {
            if !reader.has_local_members(conv) {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(reader.get_members(conv).await, HashSet::from([a, c]));
        assert_eq!(reader.get_conversations(c).await, HashSet::from([conv]));
        assert!(reader.get_conversations(b).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_entries_expire_within_bounds() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        source.set(conv, vec![UserId::new()]);
        let cache = cache_over(&source, &shared);

        cache.get_members(conv).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        cache.get_members(conv).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        // Past the upper bound both tiers have expired.
        tokio::time::advance(Duration::from_secs(242)).await;
        cache.get_members(conv).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_random_ttl_within_bounds() {
        let source: Arc<dyn MembershipSource> = Arc::new(FakeSource::default());
        let cache = MembershipCache::new(
            source,
            Arc::new(InMemorySharedCache::new()),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        for _ in 0..100 {
            let ttl = cache.random_ttl();
            assert!(ttl >= Duration::from_secs(60) && ttl <= Duration::from_secs(300));
        }
    }

    #[tokio::test]
    async fn test_invalidation_during_load_is_not_overwritten() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        source.set(conv, vec![a, b]);
        let gate = Arc::new(Notify::new());
        *source.gate.lock().unwrap() = Some(Arc::clone(&gate));

        let cache = cache_over(&source, &shared);
        let slow_read = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get_members(conv).await }
        });
        while source.loads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Membership changes while the first load is still in flight.
        source.set(conv, vec![a, c]);
        cache.invalidate_with(conv, &[b, c]).await;
        *source.gate.lock().unwrap() = None;
        gate.notify_one();

        // The overtaken read answers its own caller only.
        assert_eq!(slow_read.await.unwrap(), HashSet::from([a, b]));
        assert!(!cache.has_local_members(conv));
        assert_eq!(cache.get_members(conv).await, HashSet::from([a, c]));

        let other = cache_over(&source, &shared);
        assert_eq!(other.get_members(conv).await, HashSet::from([a, c]));
    }

    #[tokio::test]
    async fn test_shared_write_rejected_after_delete() {
        let shared = InMemorySharedCache::new();
        let key = "pulse:members:test".to_string();
        let seen = shared.version(&key).await.unwrap();

        shared.delete(std::slice::from_ref(&key)).await.unwrap();
        let stored = shared
            .put_set_if_unchanged(&key, vec!["stale".into()], Duration::from_secs(60), seen)
            .await
            .unwrap();
        assert!(!stored);
        assert!(shared.get_set(&key).await.unwrap().is_none());

        let seen = shared.version(&key).await.unwrap();
        assert!(shared
            .put_set_if_unchanged(&key, vec!["fresh".into()], Duration::from_secs(60), seen)
            .await
            .unwrap());
        assert_eq!(shared.get_set(&key).await.unwrap(), Some(vec!["fresh".to_string()]));
    }

    #[tokio::test]
    async fn test_resync_clears_local_tier() {
        let source = Arc::new(FakeSource::default());
        let shared = Arc::new(InMemorySharedCache::new());
        let conv = ConversationId::new();
        source.set(conv, vec![UserId::new()]);
        let cache = cache_over(&source, &shared);
        cache.spawn_invalidation_listener();

        cache.get_members(conv).await;
        assert!(cache.has_local_members(conv));

        shared.bus.send(CacheSignal::Resync).unwrap();
        for _ in 0..10 {
            if !cache.has_local_members(conv) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!cache.has_local_members(conv));
    }
}
