//! Re-dispatch Integration Tests
//!
//! A file whose handler is still running stays in the watched directory, so
//! the next poll cycle sees it again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use postdrop::ingest::{DirectoryWatcher, DispatchConfig, DispatchPool, FileHandler, WatchTarget};
use tempfile::TempDir;

/// Never archives, so the file is visible on every cycle
struct SlowHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl FileHandler for SlowHandler {
    async fn handle(&self, _path: PathBuf) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

async fn two_cycles(dedupe_in_flight: bool) -> (usize, usize) {
    let temp = TempDir::new().unwrap();
    tokio::fs::write(temp.path().join("slow.tpl"), b"<head></head>")
        .await
        .unwrap();

    let handler = Arc::new(SlowHandler {
        calls: AtomicUsize::new(0),
    });
    let pool = DispatchPool::new(
        handler.clone(),
        DispatchConfig {
            max_concurrent: 4,
            dedupe_in_flight,
        },
    );
    let watcher = DirectoryWatcher::new(
        WatchTarget::new(temp.path(), ".tpl", Duration::from_millis(10)),
        pool.clone(),
    );

    let first = watcher.poll_once().await.unwrap();
    let second = watcher.poll_once().await.unwrap();
    pool.drain(Duration::from_secs(5)).await;

    (
        first.dispatched + second.dispatched,
        handler.calls.load(Ordering::SeqCst),
    )
}

#[tokio::test]
async fn test_file_in_flight_is_dispatched_again_by_default() {
    let (dispatched, calls) = two_cycles(false).await;
    assert_eq!(dispatched, 2);
    assert_eq!(calls, 2);
}

#[tokio::test]
async fn test_dedupe_skips_file_in_flight() {
    let (dispatched, calls) = two_cycles(true).await;
    assert_eq!(dispatched, 1);
    assert_eq!(calls, 1);
}
