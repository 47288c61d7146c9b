//! Request deduplication: at most one live producer invocation per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FetchError, FetchResult};

/// Handle on an in-flight fetch. Every clone resolves to the same result.
pub type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

struct InFlight<T> {
    generation: u64,
    fetch: SharedFetch<T>,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

pub struct RequestCoordinator<T> {
    in_flight: InFlightMap<T>,
    generation: AtomicU64,
}

impl<T> Default for RequestCoordinator<T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

fn lock<T>(map: &InFlightMap<T>) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `key` only if it still belongs to `generation`.
fn deregister<T>(map: &InFlightMap<T>, key: &str, generation: u64) {
    let mut map = lock(map);
    if map.get(key).is_some_and(|entry| entry.generation == generation) {
        map.remove(key);
    }
}

/// A registered slot waiting for its producer.
struct Reservation<T> {
    key: String,
    generation: u64,
    in_flight: InFlightMap<T>,
    started: oneshot::Sender<JoinHandle<FetchResult<T>>>,
}

impl<T: Send + Sync + 'static> Reservation<T> {
    /// Invoke `producer` outside the registry lock and spawn its future.
    fn start<F, Fut>(self, producer: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let work = producer();
        let Reservation {
            key,
            generation,
            in_flight,
            started,
        } = self;
        let handle = tokio::spawn(async move {
            let result = work.await;
            deregister(&in_flight, &key, generation);
            result
        });
        let _ = started.send(handle);
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight fetch for `key`, or start one with `producer`.
    ///
    /// The registry lock is released before `producer` runs, so a producer
    /// may itself call back into the coordinator. Its future runs on a
    /// spawned task so it settles (and deregisters) even if every caller
    /// drops its handle. Must be called from within a tokio runtime.
    pub fn request<F, Fut>(&self, key: &str, producer: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (fetch, reservation) = {
            let mut map = lock(&self.in_flight);
            if let Some(existing) = map.get(key) {
                debug!(key = key, "Deduped request");
                return existing.fetch.clone();
            }
            self.reserve(&mut map, key)
        };
        reservation.start(producer);
        fetch
    }

    /// Always start a new producer invocation and make it the one later
    /// callers join. A fetch already in flight for `key` is not cancelled;
    /// it completes and deregisters only itself.
    pub fn request_fresh<F, Fut>(&self, key: &str, producer: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (fetch, reservation) = self.reserve(&mut lock(&self.in_flight), key);
        reservation.start(producer);
        fetch
    }

    /// Register a slot for `key` whose work is supplied later by
    /// [`Reservation::start`]. Callers joining in between wait for it.
    fn reserve(
        &self,
        map: &mut HashMap<String, InFlight<T>>,
        key: &str,
    ) -> (SharedFetch<T>, Reservation<T>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (started, task) = oneshot::channel::<JoinHandle<FetchResult<T>>>();
        let in_flight = Arc::clone(&self.in_flight);
        let owned_key = key.to_string();

        let fetch = async move {
            match task.await {
                Ok(handle) => handle
                    .await
                    .unwrap_or_else(|e| Err(FetchError::Internal(format!("fetch task failed: {}", e)))),
                Err(_) => {
                    // The producer panicked before its work was spawned
                    deregister(&in_flight, &owned_key, generation);
                    Err(FetchError::Internal("fetch was never started".to_string()))
                }
            }
        }
        .boxed()
        .shared();

        map.insert(
            key.to_string(),
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );
        let reservation = Reservation {
            key: key.to_string(),
            generation,
            in_flight: Arc::clone(&self.in_flight),
            started,
        };
        (fetch, reservation)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Forget every in-flight registration. Running fetches still complete.
    pub fn clear(&self) {
        lock(&self.in_flight).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_producer(
        calls: &Arc<AtomicUsize>,
        result: FetchResult<i32>,
    ) -> impl FnOnce() -> BoxFuture<'static, FetchResult<i32>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_invocation() {
        let coordinator = RequestCoordinator::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = coordinator.request("k", counting_producer(&calls, Ok(42)));
        let b = coordinator.request("k", counting_producer(&calls, Ok(99)));
        assert!(coordinator.is_pending("k"));

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_deregistered() {
        let coordinator = RequestCoordinator::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let offline = FetchError::NetworkUnavailable("offline".into());

        let a = coordinator.request("k", counting_producer(&calls, Err(offline.clone())));
        let b = coordinator.request("k", counting_producer(&calls, Ok(1)));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Err(offline.clone()));
        assert_eq!(b, Err(offline));
        assert_eq!(coordinator.pending_count(), 0);

        let c = coordinator.request("k", counting_producer(&calls, Ok(7))).await;
        assert_eq!(c, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_settles_even_when_handle_dropped() {
        let coordinator = RequestCoordinator::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        drop(coordinator.request("k", counting_producer(&calls, Ok(1))));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_request_fresh_starts_new_invocation() {
        let coordinator = RequestCoordinator::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = coordinator.request("k", counting_producer(&calls, Ok(1)));
        let forced = coordinator.request_fresh("k", counting_producer(&calls, Ok(2)));
        let joined = coordinator.request("k", counting_producer(&calls, Ok(3)));

        let (first, forced, joined) = tokio::join!(first, forced, joined);
        assert_eq!(first, Ok(1));
        assert_eq!(forced, Ok(2));
        assert_eq!(joined, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_producer_may_call_back_into_coordinator() {
        let coordinator = Arc::new(RequestCoordinator::<i32>::new());
        let inner = Arc::clone(&coordinator);

        let outer = coordinator.request("outer", move || {
            assert!(inner.is_pending("outer"));
            let nested = inner.request("inner", || async { Ok(2) });
            async move { Ok(nested.await? + 1) }
        });

        assert_eq!(outer.await, Ok(3));
        assert_eq!(coordinator.pending_count(), 0);
    }
}
