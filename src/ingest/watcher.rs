//! Template directory watcher.
//!
//! Polls one directory on a fixed interval and hands every matching file to
//! the dispatch pool. Polling keeps this portable and tolerant of missed
//! file-system events, at the cost of up to one interval of latency.
//!
//! A file that is still present on the next cycle (its handler has not
//! archived it yet) is dispatched again unless the pool's in-flight guard
//! is enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pool::{Dispatch, DispatchPool, ShutdownReport};

/// Extension watched when none is configured
pub const DEFAULT_EXTENSION: &str = ".tpl";

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watch loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What to watch, fixed for the lifetime of the watch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub directory: PathBuf,

    /// Exact, case-sensitive extension including the leading dot
    pub extension: String,

    pub poll_interval: Duration,
}

impl WatchTarget {
    pub fn new(directory: impl Into<PathBuf>, extension: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.into(),
            poll_interval,
        }
    }

    /// Check if the watch directory exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.directory.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.directory.clone()));
        }
        Ok(())
    }

    /// Whether `path` carries the watched extension
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extension.strip_prefix('.') == Some(ext))
            .unwrap_or(false)
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub matched: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
}

/// Polling watcher feeding a dispatch pool
pub struct DirectoryWatcher {
    target: WatchTarget,
    pool: Arc<DispatchPool>,
}

impl DirectoryWatcher {
    pub fn new(target: WatchTarget, pool: Arc<DispatchPool>) -> Self {
        Self { target, pool }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// List the directory once and dispatch every match
    pub async fn poll_once(&self) -> Result<CycleReport, WatcherError> {
        let files = list_matching_files(&self.target).await?;
        let mut report = CycleReport {
            matched: files.len(),
            ..Default::default()
        };

        for path in files {
            match self.pool.dispatch(path.clone()) {
                Dispatch::Spawned => {
                    info!(file = %path.display(), "found template; sending to be processed");
                    report.dispatched += 1;
                }
                Dispatch::SkippedInFlight => {
                    debug!(file = %path.display(), "template still in flight; skipping");
                    report.skipped_in_flight += 1;
                }
            }
        }

        Ok(report)
    }

    /// Spawn the poll loop. It runs until stopped, or until listing the
    /// directory fails.
    pub fn start(self) -> WatchHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let pool = Arc::clone(&self.pool);
        let task = tokio::spawn(run_watch_loop(self, stop_rx));

        WatchHandle {
            stop_tx,
            task: Some(task),
            pool,
        }
    }
}

/// Handle to control a running watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
    pool: Arc<DispatchPool>,
}

impl WatchHandle {
    /// Ask the loop to exit at its next sleep. Dispatched files keep going.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Resolves once the poll loop has exited on its own or been stopped
    pub async fn loop_exited(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!(error = %e, "Watch loop task failed");
            }
            self.task = None;
        }
    }

    /// Files dispatched and not yet finished
    pub fn pending(&self) -> usize {
        self.pool.pending()
    }

    /// Stop the loop, then wait up to `timeout` for dispatched files before
    /// abandoning them.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<ShutdownReport, WatcherError> {
        self.stop();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(self.pool.drain(timeout).await)
    }
}

async fn run_watch_loop(watcher: DirectoryWatcher, mut stop_rx: mpsc::Receiver<()>) {
    let target = watcher.target();
    info!(path = %target.directory.display(), "starting watcher");

    loop {
        debug!("checking for new files");
        match watcher.poll_once().await {
            Ok(report) => {
                debug!(
                    matched = report.matched,
                    dispatched = report.dispatched,
                    skipped_in_flight = report.skipped_in_flight,
                    "poll cycle finished"
                );
            }
            Err(e) => {
                error!(
                    path = %target.directory.display(),
                    error = %e,
                    "error reading existing files in folder to watch"
                );
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(target.poll_interval) => {}
            _ = stop_rx.recv() => break,
        }
    }

    info!(path = %target.directory.display(), "stopping watcher");
}

/// Regular files directly inside the target directory with the watched
/// extension, sorted by path. Subdirectories are never entered.
pub async fn list_matching_files(target: &WatchTarget) -> Result<Vec<PathBuf>, WatcherError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(&target.directory).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        if !target.matches(&path) {
            continue;
        }

        // Vanished between listing and stat: picked up next cycle if it returns
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => continue,
        };

        if !metadata.is_file() {
            continue;
        }

        files.push(path);
    }

    files.sort();
    Ok(files)
}
