//! Connectivity and pending-count monitoring.

use crate::remote::{ConnectivityProbe, RemoteApi};
use crate::sync::{SyncConfig, SyncEngine};
use async_trait::async_trait;
use herdsync_store::{KvStore, MutationQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Something that can run a sync pass.
#[async_trait]
pub trait SyncTrigger: Send + Sync + 'static {
    async fn trigger_sync(&self);
}

#[async_trait]
impl<S: KvStore, R: RemoteApi> SyncTrigger for SyncEngine<S, R> {
    async fn trigger_sync(&self) {
        self.drain().await;
    }
}

/// A change in connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityChange {
    CameOnline,
    WentOffline,
}

/// Turns a stream of connectivity samples into edges.
///
/// The first sample is always an edge, so a session that starts online
/// drains whatever the previous session left queued.
#[derive(Clone, Debug, Default)]
pub struct EdgeDetector {
    last: Option<bool>,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, online: bool) -> Option<ConnectivityChange> {
        let previous = self.last.replace(online);
        if previous == Some(online) {
            return None;
        }
        Some(if online {
            ConnectivityChange::CameOnline
        } else {
            ConnectivityChange::WentOffline
        })
    }
}

/// Polls connectivity and the queue, and starts a sync on every
/// offline-to-online edge.
pub struct NetworkMonitor {
    connectivity_interval: Duration,
    pending_interval: Duration,
    auto_sync: bool,
    online_tx: Arc<watch::Sender<bool>>,
    pending_tx: Arc<watch::Sender<usize>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Create a stopped monitor. Nothing is polled until [`Self::start`].
    pub fn new(config: &SyncConfig) -> Self {
        let (online_tx, _) = watch::channel(false);
        let (pending_tx, _) = watch::channel(0);
        Self {
            connectivity_interval: config.connectivity_poll_interval,
            pending_interval: config.pending_poll_interval,
            auto_sync: config.auto_sync,
            online_tx: Arc::new(online_tx),
            pending_tx: Arc::new(pending_tx),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the polling tasks. Calling it on a running monitor does nothing.
    pub fn start<P, T, S>(&self, probe: Arc<P>, trigger: Arc<T>, queue: Arc<MutationQueue<S>>)
    where
        P: ConnectivityProbe,
        T: SyncTrigger,
        S: KvStore,
    {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(watch_connectivity(
            probe,
            trigger,
            self.online_tx.clone(),
            self.connectivity_interval,
            self.auto_sync,
        )));
        tasks.push(tokio::spawn(watch_pending(
            queue,
            self.pending_tx.clone(),
            self.pending_interval,
        )));
        tracing::debug!("network monitor started");
    }

    /// Abort the polling tasks.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Last observed connectivity; `false` until the first poll.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    pub fn online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Publish a fresh pending count without waiting for the next poll.
    pub fn publish_pending(&self, count: usize) {
        publish_if_changed(&self.pending_tx, count);
    }

    /// Publish connectivity observed elsewhere.
    pub fn publish_online(&self, online: bool) {
        publish_if_changed(&self.online_tx, online);
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

async fn watch_connectivity<P, T>(
    probe: Arc<P>,
    trigger: Arc<T>,
    online_tx: Arc<watch::Sender<bool>>,
    every: Duration,
    auto_sync: bool,
) where
    P: ConnectivityProbe,
    T: SyncTrigger,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut edges = EdgeDetector::new();

    loop {
        ticker.tick().await;
        let online = probe.is_online().await;
        publish_if_changed(&online_tx, online);

        match edges.observe(online) {
            Some(ConnectivityChange::CameOnline) => {
                tracing::info!("connectivity restored");
                if auto_sync {
                    let trigger = trigger.clone();
                    tokio::spawn(async move { trigger.trigger_sync().await });
                }
            }
            Some(ConnectivityChange::WentOffline) => tracing::info!("connectivity lost"),
            None => {}
        }
    }
}

async fn watch_pending<S: KvStore>(
    queue: Arc<MutationQueue<S>>,
    pending_tx: Arc<watch::Sender<usize>>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let count = queue.pending_count().await;
        publish_if_changed(&pending_tx, count);
    }
}
