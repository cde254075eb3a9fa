//! TTL cache over a key-value store.

use crate::error::{CacheError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use herdsync_core::keys::{cache_key, CACHE_PREFIX};
use herdsync_core::{CacheEntry, CacheRecord, SharedClock};
use herdsync_store::KvStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type InflightFetch = Shared<BoxFuture<'static, std::result::Result<Value, String>>>;

/// Local-first cache of fetched read results.
///
/// Entries expire at an absolute time and are evicted lazily by the read
/// that finds them stale; there is no background sweep. Any storage failure
/// reads as a miss and any failed write is dropped, so the cache can make a
/// read slower but never wrong.
pub struct CacheStore<S: KvStore> {
    store: Arc<S>,
    clock: SharedClock,
    inflight: Mutex<HashMap<String, InflightFetch>>,
}

impl<S: KvStore> CacheStore<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Store `value` under `key`, expiring `ttl` from now.
    ///
    /// Returns whether the write reached storage.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.write_value(key, value, ttl).await,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache value not serializable, skipping");
                false
            }
        }
    }

    /// The cached value, if present and not expired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// The cached entry with its timestamps, if present and not expired.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let storage_key = cache_key(key);
        let raw = match self.store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        let record: CacheRecord<T> = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key, error = %e, "undecodable cache entry, evicting");
                self.evict(&storage_key).await;
                return None;
            }
        };

        let entry = CacheEntry::from_record(key, record);
        if entry.is_expired(self.clock.now_millis()) {
            tracing::debug!(key, "cache entry expired");
            self.evict(&storage_key).await;
            return None;
        }
        Some(entry)
    }

    /// Drop the entry for `key`.
    pub async fn invalidate(&self, key: &str) {
        self.evict(&cache_key(key)).await;
    }

    /// Drop every cache entry, leaving other stored state alone.
    pub async fn clear(&self) {
        match self.store.keys().await {
            Ok(keys) => {
                for key in keys.iter().filter(|k| k.starts_with(CACHE_PREFIX)) {
                    self.evict(key).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "cache clear could not list keys"),
        }
    }

    /// Return the cached value, or fetch, store and return a fresh one.
    pub async fn get_or_fetch<T, F, Fut, E>(&self, key: &str, fetch: F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        self.refresh(key, fetch, ttl).await
    }

    /// Fetch unconditionally and replace the cached value on success.
    ///
    /// Concurrent refreshes of one key share a single call to `fetch`: the
    /// first caller runs it, later callers wait on the same result.
    pub async fn refresh<T, F, Fut, E>(&self, key: &str, fetch: F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        let (shared, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => (existing.clone(), None),
                None => {
                    let pending = fetch();
                    let shared = async move {
                        let value = pending.await.map_err(|e| e.to_string())?;
                        serde_json::to_value(value).map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), shared.clone());
                    (shared, Some(LeaderGuard::new(&self.inflight, key)))
                }
            }
        };

        let outcome = shared.await;
        if leader.is_some() {
            match &outcome {
                Ok(value) => {
                    self.write_value(key, value.clone(), ttl).await;
                }
                Err(e) => tracing::warn!(key, error = %e, "cache fetch failed"),
            }
        }
        drop(leader);

        let value = outcome.map_err(CacheError::Fetch)?;
        Ok(serde_json::from_value(value)?)
    }

    async fn write_value(&self, key: &str, value: Value, ttl: Duration) -> bool {
        let entry = CacheEntry::new(key, value, self.clock.now_millis(), ttl);
        let raw = match serde_json::to_string(&entry.into_record()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache entry not serializable, skipping");
                return false;
            }
        };

        match self.store.set(&cache_key(key), raw).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache write failed, dropping");
                false
            }
        }
    }

    async fn evict(&self, storage_key: &str) {
        if let Err(e) = self.store.remove(storage_key).await {
            tracing::warn!(key = storage_key, error = %e, "cache eviction failed");
        }
    }
}

/// Clears a key's in-flight slot when the leading caller finishes or is dropped.
struct LeaderGuard<'a> {
    inflight: &'a Mutex<HashMap<String, InflightFetch>>,
    key: String,
}

impl<'a> LeaderGuard<'a> {
    fn new(inflight: &'a Mutex<HashMap<String, InflightFetch>>, key: &str) -> Self {
        Self {
            inflight,
            key: key.to_string(),
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsync_core::ManualClock;
    use herdsync_store::{FaultyKvStore, MemoryKvStore};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Herd {
        name: String,
        head: u32,
    }

    fn herd(head: u32) -> Herd {
        Herd {
            name: "north paddock".to_string(),
            head,
        }
    }

    fn cache() -> (CacheStore<FaultyKvStore<MemoryKvStore>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FaultyKvStore::new(MemoryKvStore::new()));
        (CacheStore::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (cache, _) = cache();
        assert!(cache.set("herd:1", &herd(40), Duration::from_secs(60)).await);
        assert_eq!(cache.get::<Herd>("herd:1").await, Some(herd(40)));
    }

    #[tokio::test]
    async fn test_expired_read_is_miss_and_evicts() {
        let (cache, clock) = cache();
        cache.set("herd:1", &herd(40), Duration::from_secs(60)).await;

        clock.advance(Duration::from_secs(59));
        assert!(cache.get::<Herd>("herd:1").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get::<Herd>("herd:1").await.is_none());
        assert!(cache.store().inner().raw("cache:herd:1").is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_entry() {
        let (cache, clock) = cache();
        cache.set("herd:1", &herd(40), Duration::from_secs(10)).await;
        clock.advance(Duration::from_secs(8));
        cache.set("herd:1", &herd(41), Duration::from_secs(10)).await;
        clock.advance(Duration::from_secs(8));

        let entry = cache.get_entry::<Herd>("herd:1").await.unwrap();
        assert_eq!(entry.value, herd(41));
        assert!(entry.expires_at >= entry.stored_at);
    }

    #[tokio::test]
    async fn test_storage_failures_degrade_to_miss() {
        let (cache, _) = cache();
        cache.set("herd:1", &herd(40), Duration::from_secs(60)).await;

        cache.store().fail_reads(true);
        assert!(cache.get::<Herd>("herd:1").await.is_none());

        cache.store().fail_reads(false);
        cache.store().fail_writes(true);
        assert!(!cache.set("herd:2", &herd(7), Duration::from_secs(60)).await);
        assert!(cache.get::<Herd>("herd:2").await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_evicted() {
        let (cache, _) = cache();
        cache
            .store()
            .set("cache:herd:1", "{\"data\":".to_string())
            .await
            .unwrap();

        assert!(cache.get::<Herd>("herd:1").await.is_none());
        assert!(cache.store().inner().raw("cache:herd:1").is_none());
    }

    #[tokio::test]
    async fn test_get_or_fetch_uses_fresh_value() {
        let (cache, _) = cache();
        cache.set("herd:1", &herd(40), Duration::from_secs(60)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value: Herd = cache
            .get_or_fetch(
                "herd:1",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(herd(99))
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(value, herd(40));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_or_fetch_populates_on_miss() {
        let (cache, _) = cache();
        let value: Herd = cache
            .get_or_fetch(
                "herd:1",
                || async { Ok::<_, String>(herd(12)) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(value, herd(12));
        assert_eq!(cache.get::<Herd>("herd:1").await, Some(herd(12)));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_not_cached() {
        let (cache, _) = cache();
        let result: Result<Herd> = cache
            .get_or_fetch(
                "herd:1",
                || async { Err::<Herd, _>("503 from api") },
                Duration::from_secs(60),
            )
            .await;

        assert_eq!(result, Err(CacheError::Fetch("503 from api".to_string())));
        assert!(cache.get::<Herd>("herd:1").await.is_none());
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let (cache, _) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let fetch = |calls: Arc<AtomicUsize>, gate: Arc<Notify>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok::<_, String>(herd(25))
            }
        };

        let ttl = Duration::from_secs(60);
        let (a, b, ()) = tokio::join!(
            cache.get_or_fetch::<Herd, _, _, _>("herd:1", fetch(calls.clone(), gate.clone()), ttl),
            cache.get_or_fetch::<Herd, _, _, _>("herd:1", fetch(calls.clone(), gate.clone()), ttl),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert_eq!(a.unwrap(), herd(25));
        assert_eq!(b.unwrap(), herd(25));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clear_only_touches_cache_keys() {
        let (cache, _) = cache();
        cache.set("herd:1", &herd(1), Duration::from_secs(60)).await;
        cache.set("herd:2", &herd(2), Duration::from_secs(60)).await;
        cache
            .store()
            .set("offline_queue", "[]".to_string())
            .await
            .unwrap();

        cache.clear().await;
        assert_eq!(cache.store().inner().len(), 1);
        assert!(cache.store().inner().raw("offline_queue").is_some());
    }
}
