//! Background sweeper and size-reporter loops for `SnapshotCache`,
//! grounded in the teacher's pattern of `tokio::spawn`ed long-running
//! futures (`Controller::run(...)` in `operator.rs`).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::SnapshotCache;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SIZE_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the sweeper and size-reporter tasks, returning their join
/// handles so `SnapshotCache::shutdown` can abort them.
pub fn spawn(cache: Arc<SnapshotCache>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let sweep_cache = cache.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = sweep_cache.sweep_expired().await;
            if evicted > 0 {
                info!(evicted, "swept expired snapshot cache entries");
            }
        }
    });

    let size_cache = cache.clone();
    let size_reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SIZE_REPORT_INTERVAL);
        loop {
            interval.tick().await;
            match size_cache.report_sizes().await {
                Ok((bytes, entries)) => {
                    size_cache.metrics.cache_bytes.set(bytes as f64);
                    size_cache.metrics.cache_entries.set(entries as f64);
                }
                Err(e) => warn!(error = %e, "size-gauge walk failed"),
            }
        }
    });

    (sweeper, size_reporter)
}
