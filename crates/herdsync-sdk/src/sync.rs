//! The sync engine: drains the durable queue to the remote API.

use crate::error::Result;
use crate::flag::FlagGuard;
use crate::remote::{FailureClass, RemoteApi, RemoteError, RemoteRequest};
use herdsync_core::{MutationId, QueuedMutation};
use herdsync_store::{KvStore, MutationQueue};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What happens to a mutation whose dispatch fails.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Keep the entry exactly as it was and try again on every drain.
    #[default]
    Forever,
    /// Exponential backoff with jitter; permanent failures and entries that
    /// reach `max_retries` are parked as failed.
    Backoff {
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Backoff with 5 attempts, starting at 2s and capped at 5 minutes.
    pub fn backoff() -> Self {
        RetryPolicy::Backoff {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Delay before attempt `retry + 1`: `base * 2^retry`, capped, plus up to 50% jitter.
fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry)).min(max);
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    exp + exp.mul_f64(jitter)
}

/// Configuration for sync behavior.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How often connectivity is polled.
    pub connectivity_poll_interval: Duration,
    /// How often the pending-mutation count is refreshed.
    pub pending_poll_interval: Duration,
    /// Failure handling for dispatched mutations.
    pub retry_policy: RetryPolicy,
    /// Drain automatically when the device comes online.
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connectivity_poll_interval: Duration::from_secs(5),
            pending_poll_interval: Duration::from_secs(2),
            retry_policy: RetryPolicy::Forever,
            auto_sync: true,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn connectivity_poll_interval(mut self, interval: Duration) -> Self {
        self.config.connectivity_poll_interval = interval;
        self
    }

    pub fn pending_poll_interval(mut self, interval: Duration) -> Self {
        self.config.pending_poll_interval = interval;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one drain pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries dispatched.
    pub attempted: usize,
    /// Entries confirmed and removed.
    pub succeeded: usize,
    /// Entries whose dispatch failed.
    pub failed: usize,
    /// Pending entries skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Another drain was already running, so this one did nothing.
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Events emitted by the sync engine.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A drain pass started over `queued` entries.
    DrainStarted { queued: usize },
    /// A mutation was confirmed and removed from the queue.
    Dispatched { id: MutationId, kind: String },
    /// A mutation's dispatch failed and it stays queued.
    DispatchFailed {
        id: MutationId,
        error: String,
        class: FailureClass,
    },
    /// A mutation was moved to the failed state and needs manual resolution.
    Parked { id: MutationId, error: String },
    /// A drain pass finished.
    DrainCompleted(DrainReport),
    /// A drain was requested while one was running.
    DrainSkipped,
}

/// Drains queued mutations to the remote API, one at a time, in order.
pub struct SyncEngine<S: KvStore, R: RemoteApi> {
    queue: Arc<MutationQueue<S>>,
    remote: Arc<R>,
    config: SyncConfig,
    draining: AtomicBool,
    /// Delivered entries whose removal from storage failed.
    unsettled: Mutex<HashSet<MutationId>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl<S: KvStore, R: RemoteApi> SyncEngine<S, R> {
    /// Create a new sync engine.
    pub fn new(queue: Arc<MutationQueue<S>>, remote: Arc<R>, config: SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            queue,
            remote,
            config,
            draining: AtomicBool::new(false),
            unsettled: Mutex::new(HashSet::new()),
            event_tx,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<MutationQueue<S>> {
        &self.queue
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Return entries a crashed process left in flight to the queue.
    pub async fn recover(&self) -> Result<usize> {
        Ok(self.queue.recover().await?)
    }

    /// Dispatch every due entry of the current queue snapshot.
    ///
    /// Returns immediately with a skipped report if another drain is running.
    /// Entries enqueued after the snapshot is taken wait for the next pass.
    pub async fn drain(&self) -> DrainReport {
        let Some(_draining) = FlagGuard::acquire(&self.draining) else {
            tracing::debug!("drain already in progress, skipping");
            let _ = self.event_tx.send(SyncEvent::DrainSkipped);
            return DrainReport::skipped();
        };

        self.settle_leftovers().await;

        let snapshot = self.queue.get_all().await;
        let now = self.queue.clock().now();
        let _ = self.event_tx.send(SyncEvent::DrainStarted {
            queued: snapshot.len(),
        });

        let unsettled = self.unsettled.lock().clone();
        let mut report = DrainReport::default();
        for entry in snapshot {
            if unsettled.contains(&entry.id) {
                continue;
            }
            if !entry.is_due(now) {
                if entry.next_attempt_at.is_some() && entry.is_outstanding() {
                    report.deferred += 1;
                }
                continue;
            }

            match self.dispatch(entry).await {
                Some(true) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                Some(false) => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                None => {}
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "drain completed"
            );
        }
        let _ = self.event_tx.send(SyncEvent::DrainCompleted(report.clone()));
        report
    }

    /// Clean up after an earlier pass that could not persist its outcome.
    ///
    /// Runs with the drain flag held, so every in-flight entry found here was
    /// left behind by a failed write rather than a dispatch in progress.
    async fn settle_leftovers(&self) {
        let unsettled: Vec<MutationId> = self.unsettled.lock().iter().cloned().collect();
        for id in unsettled {
            match self.queue.remove(&id).await {
                Ok(_) => {
                    tracing::info!(mutation_id = %id, "removed previously delivered mutation");
                    self.unsettled.lock().remove(&id);
                }
                Err(e) => {
                    tracing::warn!(mutation_id = %id, error = %e, "delivered mutation still not removed");
                }
            }
        }

        match self.queue.recover().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "returned stranded in-flight mutations to pending"),
            Err(e) => tracing::warn!(error = %e, "could not return in-flight mutations to pending"),
        }
    }

    /// Dispatch one entry. `None` if it vanished from the queue first.
    async fn dispatch(&self, entry: QueuedMutation) -> Option<bool> {
        let id = entry.id.clone();

        match self.queue.update(&id, |m| m.mark_in_flight()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(mutation_id = %id, "entry removed before dispatch");
                return None;
            }
            Err(e) => {
                tracing::warn!(mutation_id = %id, error = %e, "could not mark entry in flight");
                return Some(false);
            }
        }

        let response = self.remote.request(RemoteRequest::from(&entry)).await;
        match response.into_result() {
            Ok(_) => {
                if let Err(e) = self.queue.remove(&id).await {
                    tracing::error!(
                        mutation_id = %id,
                        error = %e,
                        "delivered mutation could not be removed, retrying on next drain"
                    );
                    self.unsettled.lock().insert(id.clone());
                }
                tracing::debug!(mutation_id = %id, kind = %entry.kind, "mutation delivered");
                let _ = self.event_tx.send(SyncEvent::Dispatched {
                    id,
                    kind: entry.kind,
                });
                Some(true)
            }
            Err(error) => {
                self.retain_failed(&entry, error).await;
                Some(false)
            }
        }
    }

    async fn retain_failed(&self, entry: &QueuedMutation, error: RemoteError) {
        let id = &entry.id;
        let class = error.class();
        let message = error.to_string();
        tracing::warn!(
            mutation_id = %id,
            attempt = entry.retry_count + 1,
            error = %message,
            ?class,
            "mutation dispatch failed"
        );

        let parked = match &self.config.retry_policy {
            RetryPolicy::Forever => {
                self.persist_transition(id, |m| m.revert_to_pending()).await;
                false
            }
            RetryPolicy::Backoff {
                max_retries,
                base_delay,
                max_delay,
            } => {
                if class == FailureClass::Permanent || entry.retry_count + 1 >= *max_retries {
                    let reason = message.clone();
                    self.persist_transition(id, move |m| m.mark_failed(reason))
                        .await;
                    true
                } else {
                    let delay = backoff_delay(entry.retry_count, *base_delay, *max_delay);
                    let next = self.queue.clock().now()
                        + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    let reason = message.clone();
                    self.persist_transition(id, move |m| m.record_transient_failure(reason, next))
                        .await;
                    false
                }
            }
        };

        let _ = self.event_tx.send(SyncEvent::DispatchFailed {
            id: id.clone(),
            error: message.clone(),
            class,
        });
        if parked {
            tracing::error!(mutation_id = %id, error = %message, "mutation parked as failed");
            let _ = self.event_tx.send(SyncEvent::Parked {
                id: id.clone(),
                error: message,
            });
        }
    }

    async fn persist_transition<F>(&self, id: &MutationId, transition: F)
    where
        F: FnOnce(&mut QueuedMutation) + Send,
    {
        if let Err(e) = self.queue.update(id, transition).await {
            tracing::warn!(mutation_id = %id, error = %e, "could not persist failure state");
        }
    }
}
