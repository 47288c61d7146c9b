//! The worker itself: an actor on its own thread and runtime.
//!
//! Its only inputs are intercepted requests, control messages and sync
//! events arriving over a channel; its only outputs are responses and
//! broadcasts. Nothing in it is shared with the caller's runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::bucket::BucketStorage;
use super::strategy::{BucketKind, Route, Router, Strategy};
use crate::config::WorkerConfig;
use crate::error::{FetchError, FetchResult};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::tasks::BackgroundTasks;

/// Channel buffer size for commands to the worker
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Capacity of the broadcast channel to connected contexts
const BROADCAST_CAPACITY: usize = 16;

/// Sync tag that triggers a data sync round.
pub const SYNC_DATA_TAG: &str = "sync-data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate now instead of waiting.
    ActivateNow,
    /// Fetch and store these URLs (absolute, or paths on the origin).
    WarmResources { urls: Vec<String> },
    /// Delete every bucket.
    WipeAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Broadcast {
    WipeComplete,
    BackgroundSyncComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Installing,
    Waiting,
    Active,
    Stopped,
}

enum Command {
    Fetch {
        request: HttpRequest,
        reply: oneshot::Sender<FetchResult<HttpResponse>>,
    },
    Control(ControlMessage),
    Sync {
        tag: String,
    },
    Settle {
        reply: oneshot::Sender<()>,
    },
    BucketSizes {
        reply: oneshot::Sender<BTreeMap<String, usize>>,
    },
}

fn worker_gone() -> FetchError {
    FetchError::Internal("network cache worker has stopped".to_string())
}

/// The caller's side of the worker. Cheap to clone; the worker shuts down
/// once every handle is dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    broadcasts: broadcast::Sender<Broadcast>,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl WorkerHandle {
    /// Route one request through the worker.
    pub async fn fetch(&self, request: HttpRequest) -> FetchResult<HttpResponse> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Fetch { request, reply })
            .await
            .map_err(|_| worker_gone())?;
        response.await.map_err(|_| worker_gone())?
    }

    pub async fn control(&self, message: ControlMessage) -> FetchResult<()> {
        self.commands
            .send(Command::Control(message))
            .await
            .map_err(|_| worker_gone())
    }

    /// Deliver a background sync event.
    pub async fn background_sync(&self, tag: &str) -> FetchResult<()> {
        self.commands
            .send(Command::Sync {
                tag: tag.to_string(),
            })
            .await
            .map_err(|_| worker_gone())
    }

    /// Subscribe to broadcasts. Only messages sent after subscribing arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.broadcasts.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Wait until the worker is active (or has stopped).
    pub async fn wait_until_active(&self) -> Lifecycle {
        let mut lifecycle = self.lifecycle.clone();
        let state = match lifecycle
            .wait_for(|state| matches!(state, Lifecycle::Active | Lifecycle::Stopped))
            .await
        {
            Ok(state) => *state,
            Err(_) => Lifecycle::Stopped,
        };
        state
    }

    /// Wait for every response handler and background refresh started so far.
    pub async fn settle(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Settle { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub async fn bucket_sizes(&self) -> BTreeMap<String, usize> {
        let (reply, sizes) = oneshot::channel();
        if self
            .commands
            .send(Command::BucketSizes { reply })
            .await
            .is_err()
        {
            return BTreeMap::new();
        }
        sizes.await.unwrap_or_default()
    }
}

impl Transport for WorkerHandle {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, FetchResult<HttpResponse>> {
        let handle = self.clone();
        async move { handle.fetch(request).await }.boxed()
    }
}

pub struct NetworkCacheWorker {
    config: WorkerConfig,
    router: Router,
    known_buckets: Vec<String>,
    transport: Arc<dyn Transport>,
    storage: Mutex<BucketStorage>,
    tasks: BackgroundTasks,
    broadcasts: broadcast::Sender<Broadcast>,
    lifecycle: watch::Sender<Lifecycle>,
    activate_requested: AtomicBool,
}

impl NetworkCacheWorker {
    pub fn spawn(config: WorkerConfig, transport: Arc<dyn Transport>) -> std::io::Result<WorkerHandle> {
        Self::spawn_with_storage(config, transport, BucketStorage::new())
    }

    /// Start the worker over existing buckets, e.g. those left by an older
    /// version. Stale buckets are deleted on activation.
    pub fn spawn_with_storage(
        config: WorkerConfig,
        transport: Arc<dyn Transport>,
        storage: BucketStorage,
    ) -> std::io::Result<WorkerHandle> {
        let (commands, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Installing);

        let worker = Arc::new(Self {
            router: Router::new(&config),
            known_buckets: BucketKind::ALL
                .iter()
                .map(|kind| kind.bucket_name(&config))
                .collect(),
            activate_requested: AtomicBool::new(config.skip_waiting),
            config,
            transport,
            storage: Mutex::new(storage),
            tasks: BackgroundTasks::new(),
            broadcasts: broadcasts.clone(),
            lifecycle: lifecycle_tx,
        });

        std::thread::Builder::new()
            .name("fieldcache-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Failed to start network cache worker runtime");
                        worker.lifecycle.send_replace(Lifecycle::Stopped);
                        return;
                    }
                };
                runtime.block_on(Arc::clone(&worker).run(receiver));
                worker.lifecycle.send_replace(Lifecycle::Stopped);
            })?;

        Ok(WorkerHandle {
            commands,
            broadcasts,
            lifecycle: lifecycle_rx,
        })
    }

    fn storage(&self) -> MutexGuard<'_, BucketStorage> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<Command>) {
        let installer = Arc::clone(&self);
        self.tasks.spawn(async move { installer.install().await });

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Fetch { request, reply } => {
                    let worker = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        let _ = reply.send(worker.handle_fetch(request).await);
                    });
                }
                Command::Control(message) => self.handle_control(message),
                Command::Sync { tag } => self.handle_sync(&tag),
                Command::Settle { reply } => {
                    let tasks = self.tasks.clone();
                    tokio::spawn(async move {
                        tasks.settle().await;
                        let _ = reply.send(());
                    });
                }
                Command::BucketSizes { reply } => {
                    let _ = reply.send(self.storage().sizes());
                }
            }
        }

        self.tasks.settle().await;
        debug!("Network cache worker stopped");
    }

    /// Best-effort shell pre-population; one failed asset never aborts install.
    async fn install(self: Arc<Self>) {
        info!(version = %self.config.version, "Installing network cache worker");
        let shell = BucketKind::Shell.bucket_name(&self.config);
        let mut cached = 0;

        for path in &self.config.shell_manifest {
            let Some(url) = self.resolve(path) else {
                warn!(path = %path, "Skipping unresolvable shell asset");
                continue;
            };
            let request = HttpRequest::get(url);
            match self.transport.send(request.clone()).await {
                Ok(response) if response.is_success() => {
                    self.storage().store(&shell, &request.cache_key(), response, None);
                    cached += 1;
                }
                Ok(response) => {
                    warn!(path = %path, status = response.status, "Shell asset not cached");
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Shell asset not cached");
                }
            }
        }

        info!(cached = cached, total = self.config.shell_manifest.len(), "Shell assets cached");
        self.lifecycle.send_replace(Lifecycle::Waiting);
        if self.activate_requested.load(Ordering::SeqCst) {
            self.activate();
        }
    }

    fn activate(&self) {
        if *self.lifecycle.borrow() == Lifecycle::Active {
            return;
        }
        let deleted = self.storage().retain_only(&self.known_buckets);
        for name in &deleted {
            info!(bucket = %name, "Deleted old bucket");
        }
        self.lifecycle.send_replace(Lifecycle::Active);
        info!(version = %self.config.version, "Network cache worker active");
    }

    /// Resolve an absolute URL or an origin-relative path.
    fn resolve(&self, url: &str) -> Option<Url> {
        Url::parse(url)
            .ok()
            .or_else(|| Url::parse(&self.config.origin).ok()?.join(url).ok())
    }

    fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        debug!(message = ?message, "Control message");
        match message {
            ControlMessage::ActivateNow => {
                self.activate_requested.store(true, Ordering::SeqCst);
                if *self.lifecycle.borrow() == Lifecycle::Waiting {
                    self.activate();
                }
            }
            ControlMessage::WarmResources { urls } => {
                let worker = Arc::clone(self);
                self.tasks.spawn(async move { worker.warm(urls).await });
            }
            ControlMessage::WipeAll => {
                self.storage().clear();
                info!("All buckets wiped");
                let _ = self.broadcasts.send(Broadcast::WipeComplete);
            }
        }
    }

    async fn warm(&self, urls: Vec<String>) {
        let runtime = BucketKind::Runtime;
        let name = runtime.bucket_name(&self.config);
        for raw in urls {
            let Some(url) = self.resolve(&raw) else {
                warn!(url = %raw, "Skipping unresolvable warm-up URL");
                continue;
            };
            let request = HttpRequest::get(url);
            match self.transport.send(request.clone()).await {
                Ok(response) if response.is_success() => {
                    self.storage().store(
                        &name,
                        &request.cache_key(),
                        response,
                        runtime.ceiling(&self.config),
                    );
                }
                Ok(response) => warn!(url = %raw, status = response.status, "Warm-up fetch failed"),
                Err(e) => warn!(url = %raw, error = %e, "Warm-up fetch failed"),
            }
        }
    }

    fn handle_sync(&self, tag: &str) {
        debug!(tag = tag, "Background sync");
        if tag == SYNC_DATA_TAG {
            let _ = self.broadcasts.send(Broadcast::BackgroundSyncComplete);
        }
    }

    async fn handle_fetch(self: Arc<Self>, request: HttpRequest) -> FetchResult<HttpResponse> {
        if *self.lifecycle.borrow() != Lifecycle::Active {
            return self.transport.send(request).await;
        }
        match self.router.route(&request) {
            Route::Passthrough => self.transport.send(request).await,
            Route::Intercept { bucket, strategy } => {
                debug!(url = %request.url, bucket = bucket.label(), strategy = ?strategy, "Intercepted");
                match strategy {
                    Strategy::CacheFirst => self.cache_first(request, bucket).await,
                    Strategy::NetworkFirst => self.network_first(request, bucket).await,
                    Strategy::StaleWhileRevalidate => {
                        self.stale_while_revalidate(request, bucket).await
                    }
                }
            }
        }
    }

    fn store_if_success(&self, bucket: BucketKind, key: &str, response: &HttpResponse) {
        if response.is_success() {
            self.storage().store(
                &bucket.bucket_name(&self.config),
                key,
                response.clone(),
                bucket.ceiling(&self.config),
            );
        }
    }

    fn cached(&self, bucket: BucketKind, key: &str) -> Option<HttpResponse> {
        self.storage().lookup(&bucket.bucket_name(&self.config), key)
    }

    fn shell_document(&self) -> Option<HttpResponse> {
        let url = self.resolve(&self.config.shell_document)?;
        self.cached(BucketKind::Shell, &HttpRequest::get(url).cache_key())
    }

    async fn cache_first(&self, request: HttpRequest, bucket: BucketKind) -> FetchResult<HttpResponse> {
        let key = request.cache_key();
        if let Some(cached) = self.cached(bucket, &key) {
            return Ok(cached);
        }
        match self.transport.send(request).await {
            Ok(response) => {
                self.store_if_success(bucket, &key, &response);
                Ok(response)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "Cache-first fetch failed, trying shell document");
                self.shell_document().ok_or(e)
            }
        }
    }

    async fn network_first(&self, request: HttpRequest, bucket: BucketKind) -> FetchResult<HttpResponse> {
        let key = request.cache_key();
        let navigation = request.is_navigation();
        match self.transport.send(request).await {
            Ok(response) => {
                self.store_if_success(bucket, &key, &response);
                Ok(response)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "Network failed, trying cache");
                if let Some(cached) = self.cached(bucket, &key) {
                    return Ok(cached);
                }
                if navigation {
                    if let Some(shell) = self.shell_document() {
                        return Ok(shell);
                    }
                }
                Err(e)
            }
        }
    }

    /// Serve the cached copy without waiting; refresh it in the background.
    /// With nothing cached, the caller waits on the same refresh.
    fn stale_while_revalidate(
        self: &Arc<Self>,
        request: HttpRequest,
        bucket: BucketKind,
    ) -> BoxFuture<'static, FetchResult<HttpResponse>> {
        let key = request.cache_key();
        let cached = self.cached(bucket, &key);
        let worker = Arc::clone(self);
        let refresh = async move {
            let result = worker.transport.send(request).await;
            match &result {
                Ok(response) => worker.store_if_success(bucket, &key, response),
                Err(e) => debug!(url = %key, error = %e, "Background refresh failed, keeping cached copy"),
            }
            result
        };

        match cached {
            Some(cached) => {
                self.tasks.spawn(refresh.map(|_| ()));
                async move { Ok(cached) }.boxed()
            }
            None => refresh.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::http::Destination;

    const ORIGIN: &str = "http://localhost:3000";

    fn config() -> WorkerConfig {
        WorkerConfig {
            shell_manifest: vec!["/".to_string(), "/index.html".to_string()],
            ..WorkerConfig::default()
        }
    }

    fn online() -> ScriptedTransport {
        let transport = ScriptedTransport::new();
        transport.route(ORIGIN, HttpResponse::new(200, "origin"));
        transport.route(&format!("{}/index.html", ORIGIN), HttpResponse::new(200, "<html>shell</html>"));
        transport
    }

    async fn active_worker(config: WorkerConfig, transport: &ScriptedTransport) -> WorkerHandle {
        let handle = NetworkCacheWorker::spawn(config, Arc::new(transport.clone())).expect("spawn worker");
        assert_eq!(handle.wait_until_active().await, Lifecycle::Active);
        handle
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_install_populates_shell_and_tolerates_failures() {
        let transport = online();
        transport.route(&format!("{}/missing.png", ORIGIN), HttpResponse::new(404, ""));
        let mut config = config();
        config.shell_manifest.push("/missing.png".to_string());

        let handle = active_worker(config, &transport).await;
        let sizes = handle.bucket_sizes().await;
        assert_eq!(sizes.get("fieldcache-shell-v2"), Some(&2));
    }

    #[tokio::test]
    async fn test_network_first_serves_cache_when_offline() {
        let transport = online();
        let url = "https://sheets.googleapis.com/v4/spreadsheets/abc/values/supply";
        transport.route(url, HttpResponse::new(200, "fresh rows"));
        let handle = active_worker(config(), &transport).await;

        let first = handle.fetch(get(url)).await.expect("online fetch");
        assert_eq!(first.text(), "fresh rows");

        transport.set_offline(true);
        let second = handle.fetch(get(url)).await.expect("served from cache");
        assert_eq!(second.text(), "fresh rows");
    }

    #[tokio::test]
    async fn test_network_first_offline_without_cache_propagates() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;
        transport.set_offline(true);

        let result = handle.fetch(get("https://www.googleapis.com/drive/v3/files")).await;
        assert!(matches!(result, Err(FetchError::NetworkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_offline_navigation_falls_back_to_shell() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;
        transport.set_offline(true);

        let request = HttpRequest::navigate(Url::parse("http://localhost:3000/reports").unwrap());
        let response = handle.fetch(request).await.expect("shell fallback");
        assert_eq!(response.text(), "<html>shell</html>");
    }

    #[tokio::test]
    async fn test_non_success_is_served_but_not_stored() {
        let transport = online();
        let url = "https://www.googleapis.com/drive/v3/files?q=x";
        transport.route(url, HttpResponse::new(500, "boom"));
        let handle = active_worker(config(), &transport).await;

        let response = handle.fetch(get(url)).await.expect("response");
        assert_eq!(response.status, 500);
        transport.set_offline(true);
        assert!(handle.fetch(get(url)).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_first_hits_network_once() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;
        let url = "http://localhost:3000/icons/logo.png";
        let before = transport.call_count();

        for _ in 0..3 {
            let response = handle.fetch(get(url)).await.expect("image");
            assert_eq!(response.text(), "origin");
        }
        assert_eq!(transport.call_count() - before, 1);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_refreshes_in_background() {
        let transport = online();
        let url = "http://localhost:3000/static/js/main.js";
        transport.route(url, HttpResponse::new(200, "v1"));
        let handle = active_worker(config(), &transport).await;

        assert_eq!(handle.fetch(get(url)).await.expect("first").text(), "v1");

        transport.route(url, HttpResponse::new(200, "v2"));
        assert_eq!(handle.fetch(get(url)).await.expect("cached").text(), "v1");
        handle.settle().await;
        assert_eq!(handle.fetch(get(url)).await.expect("refreshed").text(), "v2");

        // A failed refresh keeps the cached copy
        transport.set_offline(true);
        assert_eq!(handle.fetch(get(url)).await.expect("cached").text(), "v2");
        handle.settle().await;
        assert_eq!(handle.fetch(get(url)).await.expect("still cached").text(), "v2");
    }

    #[tokio::test]
    async fn test_buckets_trimmed_to_ceiling() {
        let transport = online();
        let mut config = config();
        config.limits.image = 2;
        let handle = active_worker(config, &transport).await;

        for i in 0..4 {
            let request = get(&format!("http://localhost:3000/photo-{}", i)).with_destination(Destination::Image);
            handle.fetch(request).await.expect("image");
        }
        let sizes = handle.bucket_sizes().await;
        assert_eq!(sizes.get("fieldcache-images-v2"), Some(&2));
    }

    #[tokio::test]
    async fn test_cross_origin_and_post_pass_through() {
        let transport = online();
        let url = "https://tiles.example.com/1/2/3.png";
        transport.route(url, HttpResponse::new(200, "tile"));
        let handle = active_worker(config(), &transport).await;

        handle.fetch(get(url)).await.expect("tile");
        let post = get("http://localhost:3000/submit").with_method(reqwest::Method::POST);
        handle.fetch(post).await.expect("post");

        let sizes = handle.bucket_sizes().await;
        assert_eq!(sizes.get("fieldcache-images-v2"), None);
        assert_eq!(sizes.get("fieldcache-runtime-v2"), None);
    }

    #[tokio::test]
    async fn test_waits_for_activate_now_without_skip_waiting() {
        let transport = online();
        let mut config = config();
        config.skip_waiting = false;
        let mut stale = BucketStorage::new();
        stale.store("fieldcache-api-v1", "https://www.googleapis.com/x", HttpResponse::new(200, "old"), None);

        let handle = NetworkCacheWorker::spawn_with_storage(config, Arc::new(transport.clone()), stale)
            .expect("spawn worker");

        // Not active yet: requests go straight to the network and are not stored
        let url = "https://www.googleapis.com/drive/v3/files";
        transport.route(url, HttpResponse::new(200, "files"));
        handle.fetch(get(url)).await.expect("passthrough");
        let sizes = handle.bucket_sizes().await;
        assert_eq!(sizes.get("fieldcache-api-v2"), None);
        assert!(sizes.contains_key("fieldcache-api-v1"));

        handle.control(ControlMessage::ActivateNow).await.expect("control");
        assert_eq!(handle.wait_until_active().await, Lifecycle::Active);
        let sizes = handle.bucket_sizes().await;
        assert!(!sizes.contains_key("fieldcache-api-v1"), "old version bucket deleted");
    }

    #[tokio::test]
    async fn test_warm_resources() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;

        handle
            .control(ControlMessage::WarmResources {
                urls: vec!["/reports".to_string(), "http://localhost:3000/about".to_string()],
            })
            .await
            .expect("control");
        handle.settle().await;

        transport.set_offline(true);
        let response = handle.fetch(get("http://localhost:3000/reports")).await.expect("warmed");
        assert_eq!(response.text(), "origin");
        assert_eq!(handle.bucket_sizes().await.get("fieldcache-runtime-v2"), Some(&2));
    }

    #[tokio::test]
    async fn test_wipe_all_broadcasts() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;
        let mut broadcasts = handle.subscribe();

        handle.control(ControlMessage::WipeAll).await.expect("control");
        assert_eq!(broadcasts.recv().await.expect("broadcast"), Broadcast::WipeComplete);
        assert!(handle.bucket_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn test_background_sync() {
        let transport = online();
        let handle = active_worker(config(), &transport).await;
        let mut broadcasts = handle.subscribe();

        handle.background_sync("other").await.expect("sync");
        handle.background_sync(SYNC_DATA_TAG).await.expect("sync");
        assert_eq!(
            broadcasts.recv().await.expect("broadcast"),
            Broadcast::BackgroundSyncComplete
        );
    }

    #[test]
    fn test_message_wire_shape() {
        let warm = ControlMessage::WarmResources {
            urls: vec!["/a".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&warm).unwrap(),
            serde_json::json!({"type": "WARM_RESOURCES", "urls": ["/a"]})
        );
        let parsed: ControlMessage = serde_json::from_str(r#"{"type":"ACTIVATE_NOW"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::ActivateNow);
        assert_eq!(
            serde_json::to_string(&Broadcast::WipeComplete).unwrap(),
            r#"{"type":"WIPE_COMPLETE"}"#
        );
    }
}
