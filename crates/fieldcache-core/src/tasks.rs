//! Tracked fire-and-forget work.
//!
//! Background revalidations, worker refreshes and prefetch targets are
//! spawned here instead of with a bare `tokio::spawn`, so a caller can wait
//! for "everything in the background has finished" with [`BackgroundTasks::settle`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::error;

/// Clone is cheap and every clone tracks into the same set.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn onto the current runtime. Must be called from within a runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        // Reap finished tasks so the set stays bounded between settles
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked task has finished, including tasks spawned
    /// by tracked tasks while waiting.
    pub async fn settle(&self) {
        loop {
            let mut drained = std::mem::take(&mut *self.lock());
            if drained.is_empty() {
                return;
            }
            while let Some(result) = drained.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "Background task panicked");
                    }
                }
            }
        }
    }
}
