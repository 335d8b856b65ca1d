//! Cache store trait and its type-erased wrapper.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use weft_types::node::EvictionPolicy;

use super::StoreError;

/// Write-time policy for a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entry expires after this long. `None` never expires.
    pub ttl: Option<Duration>,
    /// Store-wide entry bound enforced after the write.
    pub max_size: Option<usize>,
    /// Victim selection when `max_size` is exceeded.
    pub eviction: EvictionPolicy,
}

/// Key-value cache with TTL and bounded size.
///
/// Implementations must serialize concurrent writes to the same key.
/// Uses RPITIT (native async fn in traits).
pub trait CacheStore: Send + Sync {
    /// Get a live (non-expired) entry.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Insert or replace an entry, then evict per `policy`.
    fn set(
        &self,
        key: &str,
        value: Value,
        policy: CachePolicy,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove an entry. Returns whether it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Object-safe version of [`CacheStore`] with boxed futures.
pub trait CacheStoreDyn: Send + Sync {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>>;

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        policy: CachePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn delete_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;
}

impl<T: CacheStore> CacheStoreDyn for T {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        policy: CachePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.set(key, value, policy))
    }

    fn delete_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(self.delete(key))
    }
}

/// Type-erased cache store injected into the engine.
pub struct BoxCacheStore {
    inner: Box<dyn CacheStoreDyn>,
}

impl BoxCacheStore {
    pub fn new<T: CacheStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_boxed(key).await
    }

    pub async fn set(&self, key: &str, value: Value, policy: CachePolicy) -> Result<(), StoreError> {
        self.inner.set_boxed(key, value, policy).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_boxed(key).await
    }
}
