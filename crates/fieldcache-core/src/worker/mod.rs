//! HTTP interception cache running in its own execution context.
//!
//! The worker owns a set of versioned buckets (shell, runtime, api, images)
//! and answers each intercepted GET with a per-resource strategy:
//! cache-first for images, stale-while-revalidate for scripts/styles/fonts,
//! network-first for API calls and everything else. Callers talk to it only
//! through a [`WorkerHandle`].

pub mod actor;
pub mod bucket;
pub mod strategy;

pub use actor::{Broadcast, ControlMessage, Lifecycle, NetworkCacheWorker, WorkerHandle, SYNC_DATA_TAG};
pub use bucket::{Bucket, BucketStorage};
pub use strategy::{BucketKind, Route, Router, Strategy};
