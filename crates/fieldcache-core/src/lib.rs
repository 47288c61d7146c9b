//! fieldcache core - offline-first caching for remote, read-mostly data.
//!
//! Reads go through a stale-while-revalidate [`Orchestrator`] per data
//! namespace: a bounded in-memory tier, in-flight request deduplication,
//! and a durable tier consulted only when the network is unreachable.
//! Separately, a [`NetworkCacheWorker`] intercepts HTTP GETs and answers
//! them from versioned buckets with a per-resource strategy.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod prefetch;
pub mod services;
pub mod tasks;
pub mod worker;

pub use api::{DriveService, SheetsService};
pub use cache::{CacheKey, CacheStore, FetchOptions, FetchOutcome, FetchSource, Orchestrator, PersistentStore, RequestCoordinator};
pub use config::Config;
pub use error::{FetchError, FetchErrorKind, FetchResult, StorageError};
pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use prefetch::{PrefetchScheduler, PrefetchSnapshot, PrefetchStatus, PrefetchTarget};
pub use services::DataServices;
pub use tasks::BackgroundTasks;
pub use worker::{Broadcast, ControlMessage, Lifecycle, NetworkCacheWorker, WorkerHandle};
