//! High-level client for the herdsync SDK.

use crate::error::{Result, SdkError};
use crate::guard::{GuardConfig, GuardPhase, ProfileGuard, ProfileGuardState};
use crate::monitor::NetworkMonitor;
use crate::observability::{FlushReport, ObservabilityConfig, ObservabilityQueue};
use crate::onboarding::{OnboardingDraft, OnboardingDrafts, PendingCompletion};
use crate::query::{CachedQuery, Fetcher};
use crate::remote::{Backend, ConnectivityProbe};
use crate::sync::{DrainReport, RetryPolicy, SyncConfig, SyncEngine, SyncEvent};
use futures::FutureExt;
use herdsync_cache::CacheStore;
use herdsync_core::{MutationId, NewMutation, ObservabilityEvent, QueuedMutation, SharedClock, SystemClock};
use herdsync_store::{KvStore, MutationQueue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Configuration for the herdsync client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub sync: SyncConfig,
    pub observability: ObservabilityConfig,
    pub guard: GuardConfig,
    /// TTL for cached queries that don't name one.
    pub default_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            observability: ObservabilityConfig::default(),
            guard: GuardConfig::default(),
            default_cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.sync.retry_policy = policy;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.sync.auto_sync = enabled;
        self
    }

    pub fn observability(mut self, observability: ObservabilityConfig) -> Self {
        self.config.observability = observability;
        self
    }

    pub fn profile_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.guard.check_timeout = timeout;
        self
    }

    pub fn identity_ttl(mut self, ttl: Duration) -> Self {
        self.config.guard.identity_ttl = ttl;
        self
    }

    pub fn default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_cache_ttl = ttl;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The main herdsync client.
///
/// Wires the durable queue, sync engine, network monitor, cache,
/// observability queue and profile guard over one key-value store and one
/// backend. Nothing runs in the background until [`Client::start`].
///
/// # Example
///
/// ```rust,ignore
/// use herdsync_sdk::{Client, MemoryBackend};
/// use herdsync_core::{NewMutation, Target};
/// use herdsync_store::MemoryKvStore;
/// use std::sync::Arc;
///
/// # async fn run() -> herdsync_sdk::Result<()> {
/// let client = Client::with_defaults(Arc::new(MemoryKvStore::new()), Arc::new(MemoryBackend::new()));
/// client.start().await?;
///
/// client
///     .enqueue(NewMutation::new(
///         "record-weight",
///         Target::post("/animals/A-17/weights"),
///         serde_json::json!({ "kg": 412 }),
///     ))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<S: KvStore, B: Backend> {
    backend: Arc<B>,
    config: ClientConfig,
    queue: Arc<MutationQueue<S>>,
    engine: Arc<SyncEngine<S, B>>,
    monitor: NetworkMonitor,
    cache: Arc<CacheStore<S>>,
    observability: ObservabilityQueue<S, B>,
    guard: ProfileGuard<B, B>,
    drafts: OnboardingDrafts<S>,
}

impl<S: KvStore, B: Backend> Client<S, B> {
    pub fn new(store: Arc<S>, backend: Arc<B>, clock: SharedClock, config: ClientConfig) -> Self {
        let queue = Arc::new(MutationQueue::new(store.clone(), clock.clone()));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            backend.clone(),
            config.sync.clone(),
        ));

        Self {
            monitor: NetworkMonitor::new(&config.sync),
            cache: Arc::new(CacheStore::new(store.clone(), clock.clone())),
            observability: ObservabilityQueue::new(
                store.clone(),
                backend.clone(),
                clock.clone(),
                config.observability.clone(),
            ),
            guard: ProfileGuard::new(
                backend.clone(),
                backend.clone(),
                clock.clone(),
                config.guard.clone(),
            ),
            drafts: OnboardingDrafts::new(store, clock),
            backend,
            config,
            queue,
            engine,
        }
    }

    /// A client on the system clock with default configuration.
    pub fn with_defaults(store: Arc<S>, backend: Arc<B>) -> Self {
        Self::new(store, backend, SystemClock::shared(), ClientConfig::default())
    }

    /// Recover from a previous crash and start background monitoring.
    pub async fn start(&self) -> Result<()> {
        let recovered = self.engine.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued mutations left in flight");
        }
        self.refresh_pending().await;
        self.observability.resume().await;
        self.monitor
            .start(self.backend.clone(), self.engine.clone(), self.queue.clone());
        Ok(())
    }

    /// Stop background monitoring. Queued work stays in storage.
    pub fn stop(&self) {
        self.monitor.stop();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn queue(&self) -> &Arc<MutationQueue<S>> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine<S, B>> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<CacheStore<S>> {
        &self.cache
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    // Mutations

    /// Commit a mutation locally. It is in storage when this returns.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationId> {
        let id = self.queue.enqueue(mutation).await?;
        self.refresh_pending().await;
        Ok(id)
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    pub fn pending_watch(&self) -> watch::Receiver<usize> {
        self.monitor.pending()
    }

    pub fn online_watch(&self) -> watch::Receiver<bool> {
        self.monitor.online()
    }

    /// Drain the queue now.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        if !self.backend.is_online().await {
            return Err(SdkError::Offline);
        }
        let report = self.engine.drain().await;
        self.refresh_pending().await;
        Ok(report)
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Mutations parked by the backoff policy.
    pub async fn failed_mutations(&self) -> Vec<QueuedMutation> {
        self.queue.failed().await
    }

    pub async fn retry_failed(&self, id: &MutationId) -> Result<bool> {
        let retried = self.queue.retry_failed(id).await?;
        self.refresh_pending().await;
        Ok(retried)
    }

    pub async fn discard(&self, id: &MutationId) -> Result<bool> {
        Ok(self.queue.discard(id).await?)
    }

    async fn refresh_pending(&self) {
        self.monitor
            .publish_pending(self.queue.pending_count().await);
    }

    // Reads

    /// A stale-while-revalidate query over `key`.
    ///
    /// `ttl` falls back to the configured default.
    pub fn cached_query<T, F, Fut, E>(
        &self,
        key: impl Into<String>,
        fetch: F,
        ttl: Option<Duration>,
    ) -> Arc<CachedQuery<T, S>>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let fetch: Fetcher<T> = Arc::new(move || {
            let pending = fetch();
            async move { pending.await.map_err(|e| e.to_string()) }.boxed()
        });
        let probe: Arc<dyn ConnectivityProbe> = self.backend.clone();
        Arc::new(CachedQuery::new(
            key,
            ttl.unwrap_or(self.config.default_cache_ttl),
            self.cache.clone(),
            probe,
            fetch,
        ))
    }

    // Profile and onboarding

    pub fn guard_state(&self) -> watch::Receiver<ProfileGuardState> {
        self.guard.subscribe()
    }

    pub fn guard(&self) -> &ProfileGuard<B, B> {
        &self.guard
    }

    pub async fn check_profile(&self) -> GuardPhase {
        let phase = self.guard.evaluate().await;
        self.settle_guard(phase).await
    }

    pub async fn retry_profile_check(&self) -> GuardPhase {
        let phase = self.guard.retry().await;
        self.settle_guard(phase).await
    }

    /// Record that the user finished onboarding and re-check the backend.
    ///
    /// The completion marker stays stored until the backend confirms it.
    pub async fn confirm_onboarding(&self, data: Value) -> Result<GuardPhase> {
        self.drafts.mark_pending_completion(data).await?;
        let phase = self.guard.complete_onboarding().await;
        Ok(self.settle_guard(phase).await)
    }

    /// Forget the current session after a sign-in or sign-out.
    pub fn reset_session(&self) {
        self.guard.reset();
    }

    pub async fn save_onboarding_step(&self, step: impl Into<String>, data: Value) -> Result<()> {
        Ok(self.drafts.save_step(step, data).await?)
    }

    pub async fn onboarding_draft(&self) -> Option<OnboardingDraft> {
        self.drafts.load().await
    }

    pub async fn pending_onboarding_completion(&self) -> Option<PendingCompletion> {
        self.drafts.pending_completion().await
    }

    async fn settle_guard(&self, phase: GuardPhase) -> GuardPhase {
        if phase == GuardPhase::Ready {
            if let Err(e) = self.drafts.clear().await {
                tracing::warn!(error = %e, "could not clear onboarding drafts");
            }
        }
        phase
    }

    // Observability

    pub async fn record_event(&self, event: ObservabilityEvent) -> bool {
        self.observability.record(event).await
    }

    pub async fn flush_events(&self) -> FlushReport {
        self.observability.flush().await
    }

    pub fn observability(&self) -> &ObservabilityQueue<S, B> {
        &self.observability
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::remote::{Profile, User};
    use herdsync_core::{ManualClock, Target};
    use herdsync_store::MemoryKvStore;
    use serde_json::json;

    fn client(backend: MemoryBackend) -> Client<MemoryKvStore, MemoryBackend> {
        Client::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(backend),
            Arc::new(ManualClock::default()),
            ClientConfig::default(),
        )
    }

    fn weigh(animal: &str, kg: u32) -> NewMutation {
        NewMutation::new(
            "record-weight",
            Target::post(format!("/animals/{}/weights", animal)),
            json!({ "kg": kg }),
        )
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfigBuilder::new()
            .retry_policy(RetryPolicy::backoff())
            .auto_sync(false)
            .profile_check_timeout(Duration::from_secs(3))
            .default_cache_ttl(Duration::from_secs(60))
            .build();

        assert_eq!(config.sync.retry_policy, RetryPolicy::backoff());
        assert!(!config.sync.auto_sync);
        assert_eq!(config.guard.check_timeout, Duration::from_secs(3));
        assert_eq!(config.default_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.observability.max_retries, 3);
    }

    #[tokio::test]
    async fn test_sync_now_offline_is_an_error() {
        let client = client(MemoryBackend::offline());
        client.enqueue(weigh("A-1", 400)).await.unwrap();

        assert_eq!(client.sync_now().await, Err(SdkError::Offline));
        assert_eq!(client.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_sync_now_drains_and_updates_pending_watch() {
        let client = client(MemoryBackend::new());
        let pending = client.pending_watch();
        client.enqueue(weigh("A-1", 400)).await.unwrap();
        client.enqueue(weigh("A-2", 380)).await.unwrap();
        assert_eq!(*pending.borrow(), 2);

        let report = client.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(*pending.borrow(), 0);
        assert_eq!(client.backend().request_count(), 2);
    }

    #[tokio::test]
    async fn test_confirmed_onboarding_clears_drafts() {
        let client = client(MemoryBackend::new());
        client.backend().sign_in(User::new("u1"));
        client.backend().set_profile("u1", Profile::incomplete("ranch"));
        assert_eq!(client.check_profile().await, GuardPhase::OnboardingRequired);

        client
            .save_onboarding_step("ranch", json!({ "name": "Dry Creek" }))
            .await
            .unwrap();

        // Backend hasn't caught up; the marker stays.
        let phase = client.confirm_onboarding(json!({ "name": "Dry Creek" })).await.unwrap();
        assert_eq!(phase, GuardPhase::OnboardingRequired);
        assert!(client.pending_onboarding_completion().await.is_some());

        client.backend().set_profile("u1", Profile::completed());
        let phase = client.confirm_onboarding(json!({ "name": "Dry Creek" })).await.unwrap();
        assert_eq!(phase, GuardPhase::Ready);
        assert!(client.onboarding_draft().await.is_none());
        assert!(client.pending_onboarding_completion().await.is_none());
    }

    #[tokio::test]
    async fn test_cached_query_uses_default_ttl() {
        let client = client(MemoryBackend::new());
        let query = client.cached_query(
            "paddocks",
            || async { Ok::<_, String>(vec!["P1".to_string(), "P2".to_string()]) },
            None,
        );

        let activation = query.activate().await;
        assert!(activation.initial.data.is_none());
        activation.revalidation.unwrap().await.unwrap();

        let entry = client
            .cache()
            .get_entry::<Vec<String>>("paddocks")
            .await
            .unwrap();
        assert_eq!(entry.expires_at - entry.stored_at, 5 * 60 * 1000);
    }
}
