//! Tiered caching for remote, read-mostly data.
//!
//! - [`CacheStore`]: in-memory tier with fresh/stale bands and LRU eviction
//! - [`RequestCoordinator`]: one in-flight producer invocation per key
//! - [`PersistentStore`]: durable JSON records, consulted only when offline
//! - [`Orchestrator`]: the stale-while-revalidate read path over all three
//!
//! One `CacheStore` and one `Orchestrator` exist per namespace and are
//! injected into the data-access services that own them.

pub mod coordinator;
pub mod key;
pub mod orchestrator;
pub mod persistent;
pub mod store;

pub use coordinator::{RequestCoordinator, SharedFetch};
pub use key::CacheKey;
pub use orchestrator::{
    BackgroundUpdate, FetchOptions, FetchOutcome, FetchSource, Orchestrator, OrchestratorStats,
};
pub use persistent::{PersistentRecord, PersistentStore, FILES_NAMESPACE, SHEETS_NAMESPACE};
pub use store::{CacheHit, CacheStats, CacheStore, Freshness};
