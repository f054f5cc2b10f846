//! Process-wide Prometheus metrics and the `/` diagnostics payload,
//! grounded in the teacher's `operator::Metrics`/`Diagnostics` shape:
//! a small `Clone` struct of registered collectors plus a separately
//! locked snapshot of "what's happening right now" for the web server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use serde::Serialize;
use tokio::sync::RwLock;

/// Counters/histograms for the check pipeline, separate from
/// `cache::CacheMetrics` (which owns the snapshot-cache hit/miss/size
/// gauges) so each subsystem registers only what it needs.
#[derive(Clone)]
pub struct CoreMetrics {
    pub checks_run: IntCounterVec,
    pub checks_failed: IntCounterVec,
    pub check_duration: HistogramVec,
    pub prs_enqueued: IntCounter,
    pub prs_rejected_queue_full: IntCounter,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            checks_run: register_int_counter_vec!(
                "kubechecks_checks_run_total",
                "checks executed, by check name",
                &["check"]
            )
            .unwrap(),
            checks_failed: register_int_counter_vec!(
                "kubechecks_checks_failed_total",
                "checks that produced a non-success state, by check name",
                &["check"]
            )
            .unwrap(),
            check_duration: register_histogram_vec!(
                "kubechecks_check_duration_seconds",
                "per-check wall-clock duration",
                &["check"],
                vec![0.1, 0.5, 1., 5., 15., 30., 60., 120.]
            )
            .unwrap(),
            prs_enqueued: register_int_counter!(
                "kubechecks_prs_enqueued_total",
                "pull request checks enqueued"
            )
            .unwrap(),
            prs_rejected_queue_full: register_int_counter!(
                "kubechecks_prs_rejected_queue_full_total",
                "pull request checks rejected due to a full per-repo queue"
            )
            .unwrap(),
        }
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// State the web server's `/` endpoint reports: populated by the
/// scheduler as PR checks run, read without mutation by the HTTP handler.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub in_flight_checks: u64,
    pub queued_repos: u64,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            last_event: Utc::now(),
            in_flight_checks: 0,
            queued_repos: 0,
        }
    }
}

#[derive(Clone)]
pub struct DiagnosticsHandle(Arc<RwLock<Diagnostics>>);

impl DiagnosticsHandle {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Diagnostics::new())))
    }

    pub async fn snapshot(&self) -> Diagnostics {
        self.0.read().await.clone()
    }

    pub async fn record_event(&self) {
        self.0.write().await.last_event = Utc::now();
    }

    pub async fn set_in_flight(&self, in_flight: u64, queued_repos: u64) {
        let mut d = self.0.write().await;
        d.in_flight_checks = in_flight;
        d.queued_repos = queued_repos;
    }
}

impl Default for DiagnosticsHandle {
    fn default() -> Self {
        Self::new()
    }
}
