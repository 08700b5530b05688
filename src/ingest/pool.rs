//! Bounded dispatch pool for per-file work.
//!
//! Each dispatched path becomes its own task. A semaphore caps how many
//! handlers run at once; tasks beyond the cap wait for a permit inside
//! their own task, so dispatching never blocks the poll loop.
//!
//! With `dedupe_in_flight` enabled, a path whose task is still queued or
//! running is not dispatched again. It is off by default: a file that is
//! still in the watched directory on the next cycle gets a second task.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Receives one discovered file per call
#[async_trait]
pub trait FileHandler: Send + Sync + 'static {
    async fn handle(&self, path: PathBuf);
}

/// Pool sizing and dispatch policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Maximum handlers running at the same time
    pub max_concurrent: usize,

    /// Skip paths that already have a queued or running task
    pub dedupe_in_flight: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            dedupe_in_flight: false,
        }
    }
}

/// Result of offering one path to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Spawned,
    SkippedInFlight,
}

/// What happened to outstanding tasks during shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished before the deadline
    pub completed: usize,
    /// Tasks aborted at the deadline
    pub abandoned: usize,
}

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

pub struct DispatchPool {
    handler: Arc<dyn FileHandler>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    in_flight: InFlight,
}

impl DispatchPool {
    pub fn new(handler: Arc<dyn FileHandler>, config: DispatchConfig) -> Arc<Self> {
        let max_concurrent = config.max_concurrent.max(1);
        info!(
            max_concurrent,
            dedupe_in_flight = config.dedupe_in_flight,
            "Dispatch pool initialized"
        );

        Arc::new(Self {
            handler,
            config,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Hand a path to the handler on its own task.
    pub fn dispatch(&self, path: PathBuf) -> Dispatch {
        let guard = if self.config.dedupe_in_flight {
            match InFlightGuard::claim(&self.in_flight, &path) {
                Some(guard) => Some(guard),
                None => return Dispatch::SkippedInFlight,
            }
        } else {
            None
        };

        let handler = Arc::clone(&self.handler);
        let permits = Arc::clone(&self.permits);

        let mut tasks = lock(&self.tasks);
        reap_finished(&mut tasks);
        tasks.spawn(async move {
            let _guard = guard;
            // The semaphore is never closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            handler.handle(path).await;
        });

        Dispatch::Spawned
    }

    /// Tasks spawned and not yet reaped (queued, running, or just finished)
    pub fn pending(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Wait for outstanding tasks, aborting whatever is left at `timeout`.
    pub async fn drain(&self, timeout: Duration) -> ShutdownReport {
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(result)) => {
                    if let Err(e) = result {
                        warn!(error = %e, "File task ended abnormally");
                    }
                    report.completed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.abandoned = tasks.len();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        debug!(
            completed = report.completed,
            abandoned = report.abandoned,
            "Dispatch pool drained"
        );
        report
    }
}

/// Holds a path in the in-flight set until dropped, including on abort
struct InFlightGuard {
    set: InFlight,
    path: PathBuf,
}

impl InFlightGuard {
    fn claim(set: &InFlight, path: &PathBuf) -> Option<Self> {
        if !lock(set).insert(path.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            path: path.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.path);
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "File task ended abnormally");
        }
    }
}

/// The guarded data stays consistent even if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
