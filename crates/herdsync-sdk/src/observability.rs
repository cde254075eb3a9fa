//! Best-effort delivery of telemetry events.
//!
//! Events are persisted like mutations but are allowed to die: each failed
//! delivery bumps the event's retry counter, and an event that fails
//! [`MAX_RETRIES`] times in a row is dropped. A flush timer runs only while
//! something is queued.

use crate::flag::FlagGuard;
use crate::remote::TelemetrySink;
use herdsync_core::{ObservabilityEvent, SharedClock};
use herdsync_store::{EventQueue, KvStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive delivery failures after which an event is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Configuration for the observability queue.
#[derive(Clone, Debug)]
pub struct ObservabilityConfig {
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            max_retries: MAX_RETRIES,
        }
    }
}

/// Outcome of one flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Events still stored after the flush, including ones recorded during it.
    pub remaining: usize,
    pub skipped: bool,
}

struct Inner<S: KvStore, K: TelemetrySink> {
    events: EventQueue<S>,
    sink: Arc<K>,
    config: ObservabilityConfig,
    flushing: AtomicBool,
    timer_running: AtomicBool,
}

/// Persistent telemetry queue with bounded retries.
pub struct ObservabilityQueue<S: KvStore, K: TelemetrySink> {
    inner: Arc<Inner<S, K>>,
}

impl<S: KvStore, K: TelemetrySink> Clone for ObservabilityQueue<S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: KvStore, K: TelemetrySink> ObservabilityQueue<S, K> {
    pub fn new(
        store: Arc<S>,
        sink: Arc<K>,
        clock: SharedClock,
        config: ObservabilityConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: EventQueue::new(store, clock),
                sink,
                config,
                flushing: AtomicBool::new(false),
                timer_running: AtomicBool::new(false),
            }),
        }
    }

    /// Persist `event` and make sure the flush timer is running.
    ///
    /// Returns `false` if the event could not be stored; it is lost.
    pub async fn record(&self, event: ObservabilityEvent) -> bool {
        let id = event.id.clone();
        if let Err(e) = self.inner.events.push(event).await {
            tracing::warn!(event_id = %id, error = %e, "observability event dropped: storage unavailable");
            return false;
        }
        self.schedule();
        true
    }

    /// Try to deliver every stored event once.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Start the flush timer if anything is stored, e.g. events left by a
    /// previous session.
    pub async fn resume(&self) {
        if !self.inner.events.is_empty().await {
            self.schedule();
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.events.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.events.is_empty().await
    }

    pub async fn events(&self) -> Vec<ObservabilityEvent> {
        self.inner.events.all().await
    }

    /// Whether the flush timer is currently running.
    pub fn is_scheduled(&self) -> bool {
        self.inner.timer_running.load(Ordering::Acquire)
    }

    fn schedule(&self) {
        if self
            .inner
            .timer_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!("observability flush timer started");
        tokio::spawn(run_timer(self.inner.clone()));
    }
}

async fn run_timer<S: KvStore, K: TelemetrySink>(inner: Arc<Inner<S, K>>) {
    loop {
        tokio::time::sleep(inner.config.flush_interval).await;
        let report = inner.flush().await;
        if report.skipped || report.remaining > 0 {
            continue;
        }

        inner.timer_running.store(false, Ordering::Release);
        // An event recorded between the flush and the store above saw the
        // timer as running and did not start a new one.
        if inner.events.is_empty().await
            || inner
                .timer_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            tracing::debug!("observability queue drained, flush timer stopped");
            return;
        }
    }
}

impl<S: KvStore, K: TelemetrySink> Inner<S, K> {
    async fn flush(&self) -> FlushReport {
        let Some(_flushing) = FlagGuard::acquire(&self.flushing) else {
            return FlushReport {
                skipped: true,
                ..Default::default()
            };
        };

        let events = self.events.all().await;
        if events.is_empty() {
            return FlushReport::default();
        }

        let mut delivered = Vec::new();
        let mut dropped = Vec::new();
        let mut retried = Vec::new();

        for mut event in events {
            match self.sink.send(&event).await {
                Ok(()) => delivered.push(event.id),
                Err(e) => {
                    if event.record_failure(self.config.max_retries) {
                        tracing::warn!(
                            event_id = %event.id,
                            attempts = event.retry_count,
                            error = %e,
                            "observability event dropped after repeated failures"
                        );
                        dropped.push(event.id);
                    } else {
                        tracing::debug!(
                            event_id = %event.id,
                            attempt = event.retry_count,
                            error = %e,
                            "observability delivery failed"
                        );
                        retried.push(event);
                    }
                }
            }
        }

        let mut report = FlushReport {
            delivered: delivered.len(),
            retried: retried.len(),
            dropped: dropped.len(),
            ..Default::default()
        };
        report.remaining = match self.events.settle(&delivered, &dropped, &retried).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(error = %e, "could not persist observability flush outcome");
                self.events.len().await
            }
        };
        report
    }
}
