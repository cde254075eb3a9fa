//! Persistence for best-effort observability events.

use crate::error::Result;
use crate::kv::KvStore;
use crate::snapshot::Snapshot;
use herdsync_core::keys::OBSERVABILITY_QUEUE;
use herdsync_core::{ObservabilityEvent, SharedClock};
use std::sync::Arc;

/// Stored list of telemetry events awaiting delivery.
pub struct EventQueue<S: KvStore> {
    snapshot: Snapshot<S, ObservabilityEvent>,
}

impl<S: KvStore> EventQueue<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self {
            snapshot: Snapshot::new(store, OBSERVABILITY_QUEUE, clock),
        }
    }

    pub async fn push(&self, event: ObservabilityEvent) -> Result<()> {
        self.snapshot
            .modify(|items| {
                items.push(event);
                ((), true)
            })
            .await
    }

    /// Stored events. Storage errors read as empty.
    pub async fn all(&self) -> Vec<ObservabilityEvent> {
        self.snapshot.read_lenient().await
    }

    pub async fn len(&self) -> usize {
        self.all().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.all().await.is_empty()
    }

    /// Fold the outcome of a flush back into storage.
    ///
    /// Events listed in `delivered` or `dropped` are removed; events in
    /// `retried` replace their stored copy. Events pushed after the flush
    /// started are left untouched. Returns the number of events remaining.
    pub async fn settle(
        &self,
        delivered: &[String],
        dropped: &[String],
        retried: &[ObservabilityEvent],
    ) -> Result<usize> {
        self.snapshot
            .modify(|items| {
                items.retain(|e| !delivered.contains(&e.id) && !dropped.contains(&e.id));
                for updated in retried {
                    if let Some(slot) = items.iter_mut().find(|e| e.id == updated.id) {
                        *slot = updated.clone();
                    }
                }
                (items.len(), true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use herdsync_core::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn test_settle_keeps_late_arrivals() {
        let queue = EventQueue::new(Arc::new(MemoryKvStore::new()), Arc::new(ManualClock::default()));
        let sent = ObservabilityEvent::activity(json!({ "screen": "herd" }));
        let mut failing = ObservabilityEvent::health_log(json!({ "temp": 39.4 }));
        queue.push(sent.clone()).await.unwrap();
        queue.push(failing.clone()).await.unwrap();

        let late = ObservabilityEvent::activity(json!({ "screen": "animal" }));
        queue.push(late.clone()).await.unwrap();

        failing.retry_count = 1;
        let remaining = queue
            .settle(&[sent.id.clone()], &[], &[failing.clone()])
            .await
            .unwrap();

        assert_eq!(remaining, 2);
        let all = queue.all().await;
        assert_eq!(all[0], failing);
        assert_eq!(all[1], late);
    }
}
