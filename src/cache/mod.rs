//! SnapshotCache: a ref-counted, TTL-evicted store of
//! materialized repository snapshots that deduplicates concurrent fetches.

pub mod singleflight;
pub mod sweeper;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::{register_gauge, register_int_counter, Gauge, IntCounter};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::types::{CacheKey, ProviderState, Snapshot};

use self::singleflight::SingleFlight;

#[derive(Clone)]
pub struct CacheMetrics {
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub cache_bytes: Gauge,
    pub cache_entries: Gauge,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: register_int_counter!("snapshot_cache_hits_total", "cache hits").unwrap(),
            misses: register_int_counter!("snapshot_cache_misses_total", "cache misses").unwrap(),
            cache_bytes: register_gauge!(
                "snapshot_cache_bytes",
                "total bytes occupied by cached snapshots"
            )
            .unwrap(),
            cache_entries: register_gauge!(
                "snapshot_cache_entries",
                "number of live snapshot cache entries"
            )
            .unwrap(),
        }
    }
}

/// What a fetcher produces on a cache miss.
#[derive(Clone)]
pub struct FetchOutcome {
    pub extracted_path: PathBuf,
    pub provider_state: ProviderState,
}

/// Ref-counted, TTL-evicted, singleflight-guarded snapshot store. One
/// instance is shared across the whole process; `cache/mod.rs`'s sweeper
/// and size-reporter tasks hold an `Arc` to it.
pub struct SnapshotCache {
    map: RwLock<HashMap<CacheKey, Snapshot>>,
    singleflight: SingleFlight<CacheKey, FetchOutcome>,
    ttl: Duration,
    pub metrics: CacheMetrics,
    background: tokio::sync::Mutex<Option<(tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(HashMap::new()),
            singleflight: SingleFlight::new(),
            ttl,
            metrics: CacheMetrics::new(),
            background: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawns the sweeper and size-reporter background loops (§4.1).
    /// Idempotent: a second call replaces the stored handles without
    /// aborting the first pair, so callers should invoke this once.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        let handles = sweeper::spawn(self.clone());
        *self.background.lock().await = Some(handles);
    }

    /// Stops both background routines. Does not delete any on-disk
    /// directory — the next process start reclaims or reuses them per
    /// provider policy (§4.1).
    pub async fn shutdown(&self) {
        if let Some((sweep, size)) = self.background.lock().await.take() {
            sweep.abort();
            size.abort();
        }
    }

    /// If an entry exists, bumps `ref_count` and
    /// `last_used` under the write lock and returns immediately. Otherwise
    /// runs `fetch` behind the singleflight barrier; on success inserts a
    /// fresh entry with `ref_count = 1`; on failure, no entry is inserted
    /// and every waiter observes the same error.
    #[instrument(skip(self, fetch))]
    pub async fn acquire<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<FetchOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<FetchOutcome>>,
    {
        {
            let mut map = self.map.write().await;
            if let Some(entry) = map.get_mut(&key) {
                entry.ref_count += 1;
                entry.last_used = Utc::now();
                self.metrics.hits.inc();
                return Ok(FetchOutcome {
                    extracted_path: entry.extracted_path.clone(),
                    provider_state: entry.provider_state.clone(),
                });
            }
        }

        self.metrics.misses.inc();
        let key_for_fetch = key.clone();
        let outcome = self
            .singleflight
            .run(key.clone(), move || async move {
                let _ = &key_for_fetch;
                fetch().await
            })
            .await?;

        let mut map = self.map.write().await;
        // A racing acquire may have inserted the entry between the
        // singleflight resolving and us taking the write lock; prefer the
        // existing entry so ref-counting stays correct.
        if let Some(entry) = map.get_mut(&key) {
            entry.ref_count += 1;
            entry.last_used = Utc::now();
        } else {
            map.insert(
                key.clone(),
                Snapshot {
                    key: key.clone(),
                    extracted_path: outcome.extracted_path.clone(),
                    ref_count: 1,
                    last_used: Utc::now(),
                    provider_state: outcome.provider_state.clone(),
                },
            );
        }
        Ok(outcome)
    }

    /// Decrements `ref_count`, never below zero; a release
    /// without a matching acquire is a no-op and is logged.
    pub async fn release(&self, key: &CacheKey) {
        let mut map = self.map.write().await;
        match map.get_mut(key) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count -= 1;
                entry.last_used = Utc::now();
            }
            Some(_) => {
                warn!("release called on entry with ref_count already 0");
            }
            None => {
                warn!("release called with no matching cache entry");
            }
        }
    }

    /// Sweeps entries with `ref_count == 0` and `last_used` older than the
    /// TTL, deleting their on-disk directory. A directory removal error is
    /// logged and the map entry is still removed, to avoid repeated
    /// attempts.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut to_evict = Vec::new();
        {
            let map = self.map.read().await;
            for (key, entry) in map.iter() {
                if entry.ref_count == 0 {
                    let age = now.signed_duration_since(entry.last_used);
                    if age.to_std().unwrap_or(Duration::ZERO) > self.ttl {
                        to_evict.push((key.clone(), entry.extracted_path.clone()));
                    }
                }
            }
        }

        let mut evicted = 0;
        let mut map = self.map.write().await;
        for (key, path) in to_evict {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(error = %e, path = %path.display(), "failed removing evicted snapshot directory");
            }
            map.remove(&key);
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, remaining = map.len(), "sweep complete");
        }
        evicted
    }

    /// Walks every entry's directory and returns (total bytes, entry
    /// count). A walk error for one entry is logged and skipped, never
    /// fatal — a bad directory should not take down size reporting for
    /// every other entry.
    pub async fn report_sizes(&self) -> Result<(u64, u64)> {
        let paths: Vec<PathBuf> = {
            let map = self.map.read().await;
            map.values().map(|e| e.extracted_path.clone()).collect()
        };
        let mut total_bytes = 0u64;
        for path in &paths {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        total_bytes += meta.len();
                    }
                }
            }
        }
        Ok((total_bytes, paths.len() as u64))
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }
}
