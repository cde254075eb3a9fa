//! Stale-while-revalidate reads over the cache.

use crate::error::SdkError;
use crate::flag::FlagGuard;
use crate::remote::ConnectivityProbe;
use futures::future::BoxFuture;
use herdsync_cache::CacheStore;
use herdsync_store::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Produces a fresh value for a query.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// What a UI bound to a query should render.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    /// `data` came from the cache and has not been replaced by a fetch yet.
    pub is_from_cache: bool,
    pub is_offline: bool,
    pub is_fetching: bool,
    pub error: Option<SdkError>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_from_cache: false,
            is_offline: false,
            is_fetching: false,
            error: None,
        }
    }
}

/// Result of [`CachedQuery::activate`].
pub struct Activation<T> {
    /// State right after the cache read, before any network round-trip.
    pub initial: QueryState<T>,
    /// Background refresh, when online.
    pub revalidation: Option<JoinHandle<()>>,
}

/// A cache-backed read bound to one key.
pub struct CachedQuery<T, S: KvStore> {
    key: String,
    ttl: Duration,
    cache: Arc<CacheStore<S>>,
    probe: Arc<dyn ConnectivityProbe>,
    fetch: Fetcher<T>,
    fetching: AtomicBool,
    state: watch::Sender<QueryState<T>>,
}

impl<T, S> CachedQuery<T, S>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: KvStore,
{
    pub fn new(
        key: impl Into<String>,
        ttl: Duration,
        cache: Arc<CacheStore<S>>,
        probe: Arc<dyn ConnectivityProbe>,
        fetch: Fetcher<T>,
    ) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            key: key.into(),
            ttl,
            cache,
            probe,
            fetch,
            fetching: AtomicBool::new(false),
            state,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.state.subscribe()
    }

    /// Publish the cached value at once, then revalidate in the background
    /// if the device is online.
    ///
    /// Offline with an empty cache yields [`SdkError::EmptyCache`].
    pub async fn activate(self: &Arc<Self>) -> Activation<T> {
        let cached = self.cache.get::<T>(&self.key).await;
        let has_cached = cached.is_some();
        self.state.send_replace(QueryState {
            is_from_cache: has_cached,
            data: cached,
            ..QueryState::default()
        });

        // Subscribers already hold the cached value while the probe runs.
        let online = self.probe.is_online().await;
        self.state.send_modify(|s| {
            s.is_offline = !online;
            s.error = (!online && !has_cached).then_some(SdkError::EmptyCache);
        });
        let initial = self.state();

        if !online {
            tracing::debug!(key = %self.key, "offline, serving cache only");
            return Activation {
                initial,
                revalidation: None,
            };
        }

        let query = Arc::clone(self);
        let revalidation = tokio::spawn(async move {
            query.refresh().await;
        });
        Activation {
            initial,
            revalidation: Some(revalidation),
        }
    }

    /// Fetch now and replace the cached value on success.
    ///
    /// A refresh already running for this query makes this a no-op.
    pub async fn refresh(&self) -> QueryState<T> {
        let Some(_fetching) = FlagGuard::acquire(&self.fetching) else {
            return self.state();
        };

        if !self.probe.is_online().await {
            self.state.send_modify(|s| {
                s.is_offline = true;
                if s.data.is_none() {
                    s.error = Some(SdkError::EmptyCache);
                }
            });
            return self.state();
        }

        self.state.send_modify(|s| {
            s.is_fetching = true;
            s.is_offline = false;
        });

        let fetch = self.fetch.clone();
        let outcome = self.cache.refresh(&self.key, move || fetch(), self.ttl).await;
        self.state.send_modify(|s| {
            s.is_fetching = false;
            match outcome {
                Ok(value) => {
                    s.data = Some(value);
                    s.is_from_cache = false;
                    s.error = None;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "query refresh failed");
                    s.error = Some(e.into());
                }
            }
        });
        self.state()
    }
}
