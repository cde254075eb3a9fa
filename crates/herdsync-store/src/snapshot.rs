//! A JSON array persisted under one key, replaced whole on every change.

use crate::error::{Result, StoreError};
use crate::kv::{read_json, write_json, KvStore};
use herdsync_core::SharedClock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ordered list stored as a single value.
///
/// Read-modify-write cycles hold `write_lock` across the storage round-trip,
/// so concurrent modifications from different tasks never interleave.
pub(crate) struct Snapshot<S: KvStore, T> {
    store: Arc<S>,
    key: &'static str,
    clock: SharedClock,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<S, T> Snapshot<S, T>
where
    S: KvStore,
    T: Serialize + DeserializeOwned + Send,
{
    pub(crate) fn new(store: Arc<S>, key: &'static str, clock: SharedClock) -> Self {
        Self {
            store,
            key,
            clock,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read the current list, surfacing any storage error.
    pub(crate) async fn read(&self) -> Result<Vec<T>> {
        Ok(read_json(self.store.as_ref(), self.key)
            .await?
            .unwrap_or_default())
    }

    /// Read the current list, treating any storage error as empty.
    pub(crate) async fn read_lenient(&self) -> Vec<T> {
        match self.read().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(key = self.key, error = %e, "unreadable snapshot, treating as empty");
                Vec::new()
            }
        }
    }

    /// Apply `f` to the list and persist the result if `f` reports a change.
    ///
    /// A value that no longer decodes is moved aside under a `.corrupt-<ms>`
    /// key and replaced by an empty list rather than blocking every write.
    pub(crate) async fn modify<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<T>) -> (R, bool),
    {
        let _guard = self.write_lock.lock().await;

        let mut items = match self.read().await {
            Ok(items) => items,
            Err(StoreError::Serialization(reason)) => {
                self.quarantine(&reason).await?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let (result, changed) = f(&mut items);
        if changed {
            write_json(self.store.as_ref(), self.key, &items).await?;
        }
        Ok(result)
    }

    async fn quarantine(&self, reason: &str) -> Result<()> {
        let aside = format!("{}.corrupt-{}", self.key, self.clock.now_millis());

        if let Some(raw) = self.store.get(self.key).await? {
            self.store.set(&aside, raw).await?;
        }
        tracing::error!(key = self.key, moved_to = %aside, reason, "corrupt snapshot quarantined");
        Ok(())
    }
}
