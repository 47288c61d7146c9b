//! Startup warm-up of known high-value data.
//!
//! Each target runs as its own background task, so one target failing
//! never cancels another. Callers never await the prefetch itself; they
//! read a snapshot, or wait for it with a bound.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FetchResult;
use crate::tasks::BackgroundTasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchStatus {
    Idle,
    Loading,
    Complete,
    Error,
    /// The target's data source is not configured.
    Skipped,
}

impl PrefetchStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PrefetchStatus::Complete | PrefetchStatus::Error | PrefetchStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchSnapshot {
    pub targets: BTreeMap<String, PrefetchStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrefetchSnapshot {
    pub fn status(&self, target: &str) -> Option<PrefetchStatus> {
        self.targets.get(target).copied()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        Some((self.finished_at? - self.started_at?).num_milliseconds())
    }

    fn all_settled(&self) -> bool {
        self.targets.values().all(PrefetchStatus::is_settled)
    }
}

type PrefetchJob = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<()>> + Send + Sync>;

/// One named warm-up unit.
pub struct PrefetchTarget {
    name: String,
    job: Option<PrefetchJob>,
}

impl PrefetchTarget {
    pub fn new<F, Fut>(name: &str, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            job: Some(Arc::new(move || job().boxed())),
        }
    }

    /// A target whose source has no credentials; it is reported as skipped.
    pub fn unconfigured(name: &str) -> Self {
        Self {
            name: name.to_string(),
            job: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Inner {
    targets: Vec<PrefetchTarget>,
    state: watch::Sender<PrefetchSnapshot>,
    started: AtomicBool,
    /// Bumped by `reset` so tasks from an earlier run cannot write statuses.
    generation: AtomicU64,
    tasks: BackgroundTasks,
}

#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
}

fn idle_snapshot(targets: &[PrefetchTarget]) -> PrefetchSnapshot {
    PrefetchSnapshot {
        targets: targets
            .iter()
            .map(|t| (t.name.clone(), PrefetchStatus::Idle))
            .collect(),
        started_at: None,
        finished_at: None,
    }
}

impl PrefetchScheduler {
    pub fn new(targets: Vec<PrefetchTarget>) -> Self {
        let (state, _) = watch::channel(idle_snapshot(&targets));
        Self {
            inner: Arc::new(Inner {
                targets,
                state,
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                tasks: BackgroundTasks::new(),
            }),
        }
    }

    /// Kick off every target. Returns immediately; a second call while a run
    /// exists is a no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Prefetch already started");
            return;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        info!(targets = self.inner.targets.len(), "Starting data prefetch");

        self.inner.state.send_modify(|snapshot| {
            snapshot.started_at = Some(Utc::now());
            snapshot.finished_at = None;
            for target in &self.inner.targets {
                let status = if target.job.is_some() {
                    PrefetchStatus::Loading
                } else {
                    PrefetchStatus::Skipped
                };
                snapshot.targets.insert(target.name.clone(), status);
            }
            if snapshot.all_settled() {
                snapshot.finished_at = snapshot.started_at;
            }
        });

        for target in &self.inner.targets {
            let Some(job) = target.job.clone() else {
                debug!(target = %target.name, "Prefetch skipped, source not configured");
                continue;
            };
            let name = target.name.clone();
            let inner = Arc::clone(&self.inner);
            self.inner.tasks.spawn(async move {
                let status = match job().await {
                    Ok(()) => {
                        debug!(target = %name, "Prefetch target complete");
                        PrefetchStatus::Complete
                    }
                    Err(e) => {
                        warn!(target = %name, error = %e, "Prefetch target failed");
                        PrefetchStatus::Error
                    }
                };
                inner.finish_target(generation, &name, status);
            });
        }
    }

    pub fn snapshot(&self) -> PrefetchSnapshot {
        self.inner.state.borrow().clone()
    }

    /// True when no target is still loading.
    pub fn is_complete(&self) -> bool {
        !self
            .inner
            .state
            .borrow()
            .targets
            .values()
            .any(|s| *s == PrefetchStatus::Loading)
    }

    /// Wait at most `timeout` for the run to finish. On timeout the current
    /// snapshot is returned instead of an error. `None` if never started.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Option<PrefetchSnapshot> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.inner.state.subscribe();
        let finished = tokio::time::timeout(timeout, async move {
            state
                .wait_for(|snapshot| snapshot.finished_at.is_some())
                .await
                .map(|snapshot| snapshot.clone())
                .ok()
        })
        .await;

        match finished {
            Ok(Some(snapshot)) => Some(snapshot),
            _ => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Prefetch wait timed out");
                Some(self.snapshot())
            }
        }
    }

    /// Forget the current run; statuses go back to idle and `start` may run again.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner
            .state
            .send_replace(idle_snapshot(&self.inner.targets));
    }

    /// Wait until every spawned target task has finished.
    pub async fn settle(&self) {
        self.inner.tasks.settle().await;
    }
}

impl Inner {
    fn finish_target(&self, generation: u64, name: &str, status: PrefetchStatus) {
        self.state.send_if_modified(|snapshot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            snapshot.targets.insert(name.to_string(), status);
            if snapshot.all_settled() && snapshot.finished_at.is_none() {
                snapshot.finished_at = Some(Utc::now());
                info!(duration_ms = snapshot.duration_ms().unwrap_or_default(), "Prefetch complete");
            }
            true
        });
    }
}
