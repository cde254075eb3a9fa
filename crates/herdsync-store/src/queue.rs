//! The durable mutation queue.
//!
//! Every call that changes the queue rewrites the full `offline_queue`
//! snapshot before returning, so an acknowledged enqueue survives a crash.
//! Order is submission order; nothing reorders, merges or deduplicates
//! entries, so two mutations on the same record replay in the order they
//! were made.

use crate::error::Result;
use crate::kv::KvStore;
use crate::snapshot::Snapshot;
use herdsync_core::keys::OFFLINE_QUEUE;
use herdsync_core::{MutationId, MutationStatus, NewMutation, QueuedMutation, SharedClock};
use std::sync::Arc;

/// FIFO queue of mutations awaiting remote confirmation.
pub struct MutationQueue<S: KvStore> {
    snapshot: Snapshot<S, QueuedMutation>,
    clock: SharedClock,
}

impl<S: KvStore> MutationQueue<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self {
            snapshot: Snapshot::new(store, OFFLINE_QUEUE, clock.clone()),
            clock,
        }
    }

    /// Underlying key-value store.
    pub fn store(&self) -> &Arc<S> {
        self.snapshot.store()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Append a pending entry and persist it. Returns the new id.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationId> {
        let entry = QueuedMutation::from_new(mutation, self.clock.now());
        let id = entry.id.clone();
        let kind = entry.kind.clone();

        self.snapshot
            .modify(|items| {
                items.push(entry);
                ((), true)
            })
            .await?;

        tracing::debug!(mutation_id = %id, kind = %kind, "mutation queued");
        Ok(id)
    }

    /// All entries in submission order. Storage errors read as an empty queue.
    pub async fn get_all(&self) -> Vec<QueuedMutation> {
        self.snapshot.read_lenient().await
    }

    /// All entries in submission order, surfacing storage errors.
    pub async fn try_get_all(&self) -> Result<Vec<QueuedMutation>> {
        self.snapshot.read().await
    }

    pub async fn get(&self, id: &MutationId) -> Option<QueuedMutation> {
        self.get_all().await.into_iter().find(|m| &m.id == id)
    }

    /// Remove an entry. Removing an absent id is a no-op that writes nothing.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: &MutationId) -> Result<bool> {
        self.snapshot
            .modify(|items| {
                let before = items.len();
                items.retain(|m| &m.id != id);
                let removed = items.len() != before;
                (removed, removed)
            })
            .await
    }

    /// Apply a transition to one entry and persist it.
    ///
    /// Returns the updated entry, or `None` if the id is no longer queued.
    pub async fn update<F>(&self, id: &MutationId, transition: F) -> Result<Option<QueuedMutation>>
    where
        F: FnOnce(&mut QueuedMutation),
    {
        self.snapshot
            .modify(|items| match items.iter_mut().find(|m| &m.id == id) {
                Some(entry) => {
                    transition(entry);
                    (Some(entry.clone()), true)
                }
                None => (None, false),
            })
            .await
    }

    /// Entries still awaiting delivery (pending or in flight).
    pub async fn pending_count(&self) -> usize {
        self.get_all()
            .await
            .iter()
            .filter(|m| m.is_outstanding())
            .count()
    }

    /// Entries parked in the terminal failed state.
    pub async fn failed(&self) -> Vec<QueuedMutation> {
        self.get_all()
            .await
            .into_iter()
            .filter(|m| m.status == MutationStatus::Failed)
            .collect()
    }

    /// Put a failed entry back in line for the next drain.
    pub async fn retry_failed(&self, id: &MutationId) -> Result<bool> {
        self.snapshot
            .modify(|items| {
                match items
                    .iter_mut()
                    .find(|m| &m.id == id && m.status == MutationStatus::Failed)
                {
                    Some(entry) => {
                        entry.reset_for_retry();
                        (true, true)
                    }
                    None => (false, false),
                }
            })
            .await
    }

    /// Drop a failed entry for good.
    pub async fn discard(&self, id: &MutationId) -> Result<bool> {
        self.snapshot
            .modify(|items| {
                let before = items.len();
                items.retain(|m| !(&m.id == id && m.status == MutationStatus::Failed));
                let removed = items.len() != before;
                (removed, removed)
            })
            .await
    }

    /// Return entries left in flight by an interrupted process to pending.
    ///
    /// Returns the number of entries recovered.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self
            .snapshot
            .modify(|items| {
                let mut count = 0;
                for entry in items
                    .iter_mut()
                    .filter(|m| m.status == MutationStatus::InFlight)
                {
                    entry.revert_to_pending();
                    count += 1;
                }
                (count, count > 0)
            })
            .await?;

        if recovered > 0 {
            tracing::info!(recovered, "recovered interrupted dispatches");
        }
        Ok(recovered)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<()> {
        self.snapshot
            .modify(|items| {
                let changed = !items.is_empty();
                items.clear();
                ((), changed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FaultyKvStore, MemoryKvStore};
    use herdsync_core::{ManualClock, Target};
    use serde_json::json;

    fn queue() -> MutationQueue<FaultyKvStore<MemoryKvStore>> {
        MutationQueue::new(
            Arc::new(FaultyKvStore::new(MemoryKvStore::new())),
            Arc::new(ManualClock::default()),
        )
    }

    fn treatment(animal: u32) -> NewMutation {
        NewMutation::new(
            "record-treatment",
            Target::post(format!("/animals/{}/treatments", animal)),
            json!({ "drug": "oxytetracycline", "animal": animal }),
        )
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let q = queue();
        let a = q.enqueue(treatment(1)).await.unwrap();
        let b = q.enqueue(treatment(2)).await.unwrap();
        let c = q.enqueue(treatment(3)).await.unwrap();

        let ids: Vec<_> = q.get_all().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_enqueue_is_persisted_before_returning() {
        let q = queue();
        let id = q.enqueue(treatment(9)).await.unwrap();

        let raw = q.store().inner().raw(OFFLINE_QUEUE).unwrap();
        assert!(raw.contains(id.as_str()));
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_write_failure() {
        let q = queue();
        q.store().fail_writes(true);
        assert!(q.enqueue(treatment(1)).await.is_err());

        q.store().fail_writes(false);
        assert!(q.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let q = queue();
        q.enqueue(treatment(1)).await.unwrap();
        let writes = q.store().write_count();

        let removed = q.remove(&MutationId::new("nope")).await.unwrap();
        assert!(!removed);
        assert_eq!(q.store().write_count(), writes);
        assert_eq!(q.get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let q = queue();
        let id = q.enqueue(treatment(1)).await.unwrap();

        assert!(q.remove(&id).await.unwrap());
        assert!(!q.remove(&id).await.unwrap());
        assert!(q.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_empty() {
        let q = queue();
        q.enqueue(treatment(1)).await.unwrap();

        q.store().fail_reads(true);
        assert!(q.get_all().await.is_empty());
        assert_eq!(q.pending_count().await, 0);
        assert!(q.try_get_all().await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_quarantined() {
        let q = queue();
        q.store()
            .set(OFFLINE_QUEUE, "[{\"id\":".to_string())
            .await
            .unwrap();

        let id = q.enqueue(treatment(4)).await.unwrap();
        let all = q.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);

        let keys = q.store().keys().await.unwrap();
        let aside = format!("offline_queue.corrupt-{}", q.clock().now_millis());
        assert!(keys.contains(&aside));
        assert_eq!(
            q.store().get(&aside).await.unwrap().as_deref(),
            Some("[{\"id\":")
        );
    }

    #[tokio::test]
    async fn test_recover_resets_in_flight() {
        let q = queue();
        let id = q.enqueue(treatment(1)).await.unwrap();
        q.update(&id, |m| m.mark_in_flight()).await.unwrap();
        assert_eq!(q.pending_count().await, 1);

        assert_eq!(q.recover().await.unwrap(), 1);
        assert_eq!(q.get(&id).await.unwrap().status, MutationStatus::Pending);
        assert_eq!(q.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_entries_can_be_retried_or_discarded() {
        let q = queue();
        let a = q.enqueue(treatment(1)).await.unwrap();
        let b = q.enqueue(treatment(2)).await.unwrap();
        q.update(&a, |m| m.mark_failed("422")).await.unwrap();
        q.update(&b, |m| m.mark_failed("400")).await.unwrap();

        assert_eq!(q.pending_count().await, 0);
        assert_eq!(q.failed().await.len(), 2);

        assert!(q.retry_failed(&a).await.unwrap());
        assert!(!q.retry_failed(&a).await.unwrap());
        assert_eq!(q.pending_count().await, 1);

        assert!(!q.discard(&a).await.unwrap());
        assert!(q.discard(&b).await.unwrap());
        assert_eq!(q.get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_entry_returns_none() {
        let q = queue();
        let result = q
            .update(&MutationId::new("gone"), |m| m.mark_in_flight())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_all_kept() {
        let q = Arc::new(queue());
        let mut handles = Vec::new();
        for i in 0..20 {
            let q = q.clone();
            handles.push(tokio::spawn(async move { q.enqueue(treatment(i)).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(q.get_all().await.len(), 20);
    }

    #[tokio::test]
    async fn test_clear_empties_queue() {
        let q = queue();
        q.enqueue(treatment(1)).await.unwrap();
        q.clear().await.unwrap();
        assert!(q.get_all().await.is_empty());
    }
}
