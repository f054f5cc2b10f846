//! Per-repo FIFO queue with cancel-on-replace semantics. One actor task
//! per normalized repo URL, spawned lazily and torn down when idle.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReplanPolicy;
use crate::types::PullRequest;

/// A unit of work on a repo's queue: the PR to check, plus a cancellation
/// token this entry's task inherits.
pub struct QueueEntry {
    pub pr: PullRequest,
    pub cancel: CancellationToken,
}

struct RepoQueueState {
    entries: VecDeque<QueueEntry>,
}

/// One FIFO queue per normalized repo URL. `replace` implements
/// cancel-on-replace: a replan comment for a PR whose prior entry is still
/// queued cancels and discards the older entry before it reaches the
/// front; per `ReplanPolicy::Drain`, the older entry is left to finish
/// instead.
pub struct RepoQueue {
    state: Mutex<RepoQueueState>,
    max_depth: usize,
    policy: ReplanPolicy,
}

impl RepoQueue {
    pub fn new(max_depth: usize, policy: ReplanPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RepoQueueState {
                entries: VecDeque::new(),
            }),
            max_depth,
            policy,
        })
    }

    /// Enqueues `pr`. If an older, not-yet-dequeued entry for the same
    /// `check_id` exists and the policy is `CancelQueued`, it is cancelled
    /// and removed first. Returns an error if the queue is at capacity, so
    /// overflow is rejected with a user-visible failure rather than
    /// growing unbounded.
    pub async fn enqueue(&self, pr: PullRequest) -> crate::error::Result<CancellationToken> {
        let mut state = self.state.lock().await;

        if self.policy == ReplanPolicy::CancelQueued {
            if let Some(pos) = state.entries.iter().position(|e| e.pr.check_id == pr.check_id) {
                let old = state.entries.remove(pos).unwrap();
                old.cancel.cancel();
                info!(check_id = %pr.check_id, "superseded queued entry cancelled (replan)");
            }
        }

        if state.entries.len() >= self.max_depth {
            return Err(crate::error::Error::Internal(format!(
                "repo queue overflow: depth {} >= max {}",
                state.entries.len(),
                self.max_depth
            )));
        }

        let cancel = CancellationToken::new();
        state.entries.push_back(QueueEntry {
            pr,
            cancel: cancel.clone(),
        });
        Ok(cancel)
    }

    pub async fn dequeue(&self) -> Option<QueueEntry> {
        self.state.lock().await.entries.pop_front()
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

/// Spawns the actor task that drains `queue` one entry at a time via
/// `mpsc`-signaled wakeups, invoking `process` for each dequeued entry.
/// The task exits once `shutdown` fires and the queue is empty.
pub fn spawn_repo_actor<F, Fut>(
    queue: Arc<RepoQueue>,
    mut wake: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    process: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(QueueEntry) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            while let Some(entry) = queue.dequeue().await {
                if entry.cancel.is_cancelled() {
                    continue;
                }
                process(entry).await;
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if queue.depth().await == 0 {
                        break;
                    }
                }
                woken = wake.recv() => {
                    if woken.is_none() {
                        break;
                    }
                }
            }
        }
        warn!("repo actor task exiting (queue idle)");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(check_id: &str) -> PullRequest {
        PullRequest {
            provider: "github".into(),
            full_name: "org/repo".into(),
            check_id: check_id.into(),
            head_sha: "abc".into(),
            base_ref: "main".into(),
            head_ref: "feature".into(),
            clone_url: "https://example.com/org/repo".into(),
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = RepoQueue::new(10, ReplanPolicy::CancelQueued);
        q.enqueue(pr("1")).await.unwrap();
        q.enqueue(pr("2")).await.unwrap();
        let first = q.dequeue().await.unwrap();
        assert_eq!(first.pr.check_id, "1");
    }

    #[tokio::test]
    async fn replan_cancels_older_queued_entry() {
        let q = RepoQueue::new(10, ReplanPolicy::CancelQueued);
        let first_cancel = q.enqueue(pr("1")).await.unwrap();
        q.enqueue(pr("1")).await.unwrap();
        assert!(first_cancel.is_cancelled());
        assert_eq!(q.depth().await, 1);
    }

    #[tokio::test]
    async fn drain_policy_keeps_older_entry() {
        let q = RepoQueue::new(10, ReplanPolicy::Drain);
        let first_cancel = q.enqueue(pr("1")).await.unwrap();
        q.enqueue(pr("1")).await.unwrap();
        assert!(!first_cancel.is_cancelled());
        assert_eq!(q.depth().await, 2);
    }

    #[tokio::test]
    async fn overflow_is_rejected() {
        let q = RepoQueue::new(1, ReplanPolicy::Drain);
        q.enqueue(pr("1")).await.unwrap();
        assert!(q.enqueue(pr("2")).await.is_err());
    }
}
