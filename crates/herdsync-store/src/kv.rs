//! Key-value storage abstraction.

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Abstract string key-value store.
///
/// `set` must replace the whole value atomically: a reader sees either the
/// previous value or the new one, never a torn write.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every stored key.
    async fn keys(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }
}

/// Read and decode a JSON value.
pub async fn read_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn write_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: KvStore + ?Sized,
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw access for assertions.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Wraps a store and injects failures on demand.
///
/// Used to exercise the degrade-to-miss paths of the layers above.
pub struct FaultyKvStore<S: KvStore> {
    inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl<S: KvStore> FaultyKvStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set`/`remove` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, key: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("injected fault on {}", key)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: KvStore> KvStore for FaultyKvStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check(&self.fail_reads, key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check(&self.fail_writes, key)?;
        self.inner.set(key, value).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check(&self.fail_writes, key)?;
        self.inner.remove(key).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check(&self.fail_reads, "*")?;
        self.inner.keys().await
    }
}
