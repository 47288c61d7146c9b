//! Stale-while-revalidate read protocol.
//!
//! Feature code hands the orchestrator a key and a producer; the
//! orchestrator decides between the in-memory tier, a (deduplicated)
//! network fetch and the durable fallback, and reports which one answered.

use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::coordinator::RequestCoordinator;
use super::key::CacheKey;
use super::persistent::PersistentStore;
use super::store::{CacheStats, CacheStore};
use crate::error::{FetchResult, StorageError};
use crate::tasks::BackgroundTasks;

/// Which tier produced the data handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchSource {
    CacheFresh,
    CacheStale,
    Network,
    PersistentFallback,
}

impl FetchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchSource::CacheFresh => "cache-fresh",
            FetchSource::CacheStale => "cache-stale",
            FetchSource::Network => "network",
            FetchSource::PersistentFallback => "persistent-fallback",
        }
    }

    /// Anything not straight off the network may be outdated.
    pub fn is_possibly_outdated(&self) -> bool {
        !matches!(self, FetchSource::Network)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome<T> {
    pub data: T,
    pub source: FetchSource,
}

impl<T> FetchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        FetchOutcome {
            data: f(self.data),
            source: self.source,
        }
    }
}

/// Called at most once with the revalidated payload, strictly after the
/// stale result has been returned.
pub type BackgroundUpdate<T> = Box<dyn FnOnce(T) + Send + 'static>;

pub struct FetchOptions<T> {
    pub force_refresh: bool,
    pub on_background_update: Option<BackgroundUpdate<T>>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self {
            force_refresh: false,
            on_background_update: None,
        }
    }
}

impl<T> FetchOptions<T> {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            on_background_update: None,
        }
    }

    pub fn on_update(mut self, callback: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_background_update = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub pending_requests: usize,
    pub background_tasks: usize,
}

/// One namespace's read path. Clone is cheap; clones share every tier.
pub struct Orchestrator<T> {
    persistent_namespace: String,
    cache: Arc<CacheStore<T>>,
    coordinator: Arc<RequestCoordinator<T>>,
    persistent: Option<Arc<PersistentStore>>,
    background: BackgroundTasks,
}

impl<T> Clone for Orchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            persistent_namespace: self.persistent_namespace.clone(),
            cache: Arc::clone(&self.cache),
            coordinator: Arc::clone(&self.coordinator),
            persistent: self.persistent.clone(),
            background: self.background.clone(),
        }
    }
}

impl<T> Orchestrator<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        cache: Arc<CacheStore<T>>,
        persistent: Option<Arc<PersistentStore>>,
        persistent_namespace: &str,
    ) -> Self {
        Self {
            persistent_namespace: persistent_namespace.to_string(),
            cache,
            coordinator: Arc::new(RequestCoordinator::new()),
            persistent,
            background: BackgroundTasks::new(),
        }
    }

    pub fn cache(&self) -> &CacheStore<T> {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator<T> {
        &self.coordinator
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub async fn fetch<F, Fut>(&self, key: &CacheKey, producer: F) -> FetchResult<FetchOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        self.fetch_with(key, producer, FetchOptions::default()).await
    }

    pub async fn fetch_with<F, Fut>(
        &self,
        key: &CacheKey,
        producer: F,
        options: FetchOptions<T>,
    ) -> FetchResult<FetchOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        if options.force_refresh {
            self.cache.delete(key);
            debug!(key = %key, "Forced refresh");
            let fetch = self
                .coordinator
                .request_fresh(key.as_str(), || self.write_through(key, producer()));
            return self.await_network(key, fetch.await).await;
        }

        if let Some(hit) = self.cache.get(key) {
            if hit.is_fresh {
                debug!(key = %key, source = "cache-fresh", "Cache hit");
                return Ok(FetchOutcome {
                    data: hit.payload,
                    source: FetchSource::CacheFresh,
                });
            }

            debug!(key = %key, source = "cache-stale", "Cache hit, revalidating");
            let handed_back = self.revalidate(key, producer, options.on_background_update);
            let outcome = FetchOutcome {
                data: hit.payload,
                source: FetchSource::CacheStale,
            };
            let _ = handed_back.send(());
            return Ok(outcome);
        }

        debug!(key = %key, "Cache miss");
        let fetch = self
            .coordinator
            .request(key.as_str(), || self.write_through(key, producer()));
        self.await_network(key, fetch.await).await
    }

    /// Start the background refresh. The update callback waits until the
    /// returned sender fires, i.e. until the stale value is handed back.
    fn revalidate<F, Fut>(
        &self,
        key: &CacheKey,
        producer: F,
        on_update: Option<BackgroundUpdate<T>>,
    ) -> oneshot::Sender<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (handed_back, stale_returned) = oneshot::channel();
        let fetch = self
            .coordinator
            .request(key.as_str(), || self.write_through(key, producer()));
        let key = key.clone();
        self.background.spawn(async move {
            let result = fetch.await;
            let _ = stale_returned.await;
            match result {
                Ok(fresh) => {
                    debug!(key = %key, "Background revalidation complete");
                    if let Some(callback) = on_update {
                        callback(fresh);
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Background revalidation failed");
                }
            }
        });
        handed_back
    }

    /// Wrap a producer future so that one successful invocation writes both
    /// tiers exactly once, however many callers share it.
    fn write_through<Fut>(&self, key: &CacheKey, work: Fut) -> impl Future<Output = FetchResult<T>> + Send + 'static
    where
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let persistent = self.persistent.clone();
        let namespace = self.persistent_namespace.clone();
        let key = key.clone();
        async move {
            let data = work.await?;
            cache.set(&key, data.clone());
            if let Some(store) = persistent {
                match store.put(&namespace, key.id(), &data).await {
                    Ok(()) => {}
                    Err(e @ StorageError::QuotaExceeded { .. }) => {
                        warn!(key = %key, error = %e, "Storage quota exceeded, continuing without durability");
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to persist fetched data");
                    }
                }
            }
            Ok(data)
        }
    }

    async fn await_network(&self, key: &CacheKey, result: FetchResult<T>) -> FetchResult<FetchOutcome<T>> {
        match result {
            Ok(data) => Ok(FetchOutcome {
                data,
                source: FetchSource::Network,
            }),
            Err(e) if e.is_network_unavailable() => {
                let Some(store) = &self.persistent else {
                    return Err(e);
                };
                match store.get::<T>(&self.persistent_namespace, key.id()).await {
                    Some(data) => {
                        warn!(key = %key, error = %e, "Network unavailable, serving persisted copy");
                        Ok(FetchOutcome {
                            data,
                            source: FetchSource::PersistentFallback,
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.delete(key)
    }

    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.cache.clear_by_namespace(namespace)
    }

    /// Drop every in-memory entry whose full key satisfies `matches`.
    pub fn invalidate_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        self.cache.clear_matching(matches)
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.coordinator.clear();
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cache: self.cache.stats(),
            pending_requests: self.coordinator.pending_count(),
            background_tasks: self.background.len(),
        }
    }

    /// Wait for every background revalidation started so far.
    pub async fn settle(&self) {
        self.background.settle().await;
    }
}
