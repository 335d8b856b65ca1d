//! In-memory store implementations backed by `DashMap`.
//!
//! DashMap's entry API holds the shard lock for the duration of a write, which
//! gives per-key serialization for `set` and `update`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::time::Instant;
use weft_types::node::EvictionPolicy;

use super::cache::{CachePolicy, CacheStore};
use super::variables::{UpdateFn, VariableStore};
use super::StoreError;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    /// Logical clock of the last read or write.
    last_access: u64,
    hits: u64,
    inserted: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Process-local cache with TTL expiry and LRU/LFU/TTL eviction.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: AtomicU64,
    /// Soonest expiry among stored entries. Writes purge once it has passed.
    next_expiry: Mutex<Option<Instant>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn purge_expired(&self, now: Instant) {
        let mut next = self
            .next_expiry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.entries.retain(|_, e| !e.is_expired(now));
        *next = self.entries.iter().filter_map(|e| e.expires_at).min();
    }

    /// Purge only when some entry is known to have expired.
    fn purge_due(&self, now: Instant) {
        let due = self
            .next_expiry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|t| t <= now);
        if due {
            self.purge_expired(now);
        }
    }

    fn note_expiry(&self, at: Instant) {
        let mut next = self
            .next_expiry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next = Some(next.map_or(at, |t| t.min(at)));
    }

    /// Pick the entry to drop, never the one just written.
    fn victim(&self, policy: EvictionPolicy, keep: &str) -> Option<String> {
        let candidates = self
            .entries
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.key().clone(), e.value().clone()));

        match policy {
            EvictionPolicy::Lru => candidates
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k),
            EvictionPolicy::Lfu => candidates
                .min_by_key(|(_, e)| (e.hits, e.last_access))
                .map(|(k, _)| k),
            // Soonest expiry first; entries without a TTL go last, oldest first.
            EvictionPolicy::Ttl => candidates
                .min_by_key(|(_, e)| (e.expires_at.is_none(), e.expires_at, e.inserted))
                .map(|(k, _)| k),
        }
    }
}

impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        let tick = self.tick();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired(now) => {
                entry.remove();
                Ok(None)
            }
            Entry::Occupied(mut entry) => {
                let e = entry.get_mut();
                e.hits += 1;
                e.last_access = tick;
                Ok(Some(e.value.clone()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, policy: CachePolicy) -> Result<(), StoreError> {
        let now = Instant::now();
        let tick = self.tick();
        self.purge_due(now);

        let expires_at = policy.ttl.map(|ttl| now + ttl);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                last_access: tick,
                hits: 0,
                inserted: tick,
            },
        );
        if let Some(at) = expires_at {
            self.note_expiry(at);
        }

        if let Some(max) = policy.max_size {
            while self.entries.len() > max.max(1) {
                let Some(victim) = self.victim(policy.eviction, key) else {
                    break;
                };
                tracing::debug!(key = victim.as_str(), policy = ?policy.eviction, "evicting cache entry");
                self.entries.remove(&victim);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Process-local global variable store.
#[derive(Debug, Default)]
pub struct MemoryVariableStore {
    values: DashMap<String, Value>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VariableStore for MemoryVariableStore {
    async fn get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(name).map(|v| v.value().clone()))
    }

    async fn set(&self, name: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.values.remove(name);
        Ok(())
    }

    async fn update(&self, name: &str, f: UpdateFn) -> Result<Value, StoreError> {
        let next = match self.values.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = f(Some(entry.get().clone()));
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                let next = f(None);
                entry.insert(next.clone());
                next
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn bounded(max: usize, eviction: EvictionPolicy) -> CachePolicy {
        CachePolicy {
            ttl: None,
            max_size: Some(max),
            eviction,
        }
    }

    #[tokio::test]
    async fn test_cache_set_get_delete() {
        let cache = MemoryCacheStore::new();
        cache.set("a", json!(1), CachePolicy::default()).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_expiry() {
        let cache = MemoryCacheStore::new();
        let policy = CachePolicy {
            ttl: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        cache.set("k", json!("v"), policy).await.unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("v")));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged_on_write_without_max_size() {
        let cache = MemoryCacheStore::new();
        let policy = CachePolicy {
            ttl: Some(Duration::from_millis(10)),
            max_size: None,
            eviction: EvictionPolicy::Ttl,
        };
        for i in 0..100 {
            cache.set(&format!("k{i}"), json!(i), policy).await.unwrap();
        }
        assert_eq!(cache.len(), 100);

        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("fresh", json!("v"), policy).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_without_ttl_survive_purge() {
        let cache = MemoryCacheStore::new();
        let short = CachePolicy {
            ttl: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        cache.set("kept", json!(1), CachePolicy::default()).await.unwrap();
        cache.set("gone", json!(2), short).await.unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        cache.set("other", json!(3), CachePolicy::default()).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("kept").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let cache = MemoryCacheStore::new();
        let policy = bounded(2, EvictionPolicy::Lru);
        cache.set("a", json!(1), policy).await.unwrap();
        cache.set("b", json!(2), policy).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", json!(3), policy).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lfu_evicts_least_frequently_used() {
        let cache = MemoryCacheStore::new();
        let policy = bounded(2, EvictionPolicy::Lfu);
        cache.set("a", json!(1), policy).await.unwrap();
        cache.set("b", json!(2), policy).await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        cache.set("c", json!(3), policy).await.unwrap();

        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_policy_evicts_soonest_expiry() {
        let cache = MemoryCacheStore::new();
        let short = CachePolicy {
            ttl: Some(Duration::from_secs(10)),
            max_size: Some(2),
            eviction: EvictionPolicy::Ttl,
        };
        let long = CachePolicy {
            ttl: Some(Duration::from_secs(60)),
            ..short
        };
        cache.set("long", json!(1), long).await.unwrap();
        cache.set("short", json!(2), short).await.unwrap();
        cache.set("new", json!(3), long).await.unwrap();

        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_variable_update_is_atomic_per_key() {
        let store = Arc::new(MemoryVariableStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        "hits",
                        Box::new(|v| json!(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("hits").await.unwrap(), Some(json!(50)));
    }
}
