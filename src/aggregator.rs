//! MessageAggregator: the single, progressively-updated review comment
//! for one PR check. Checks write `CheckResult`s into it concurrently;
//! `render` takes a stable snapshot, formats it, and posts/updates the
//! comment(s) via `VcsClient`.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::MessageConfig;
use crate::error::Result;
use crate::markdown;
use crate::types::{CheckResult, Message, PullRequest};
use crate::vcs::VcsClient;

struct AggregatorState {
    message: Message,
    comment_ids: Vec<String>,
}

/// One instance per PR check (constructed fresh by the caller of
/// `CheckScheduler::enqueue`); `apps`/`deleted` are mutated under a
/// single mutex — individual `Vec<CheckResult>` per app are append-only
/// under that same lock, per spec.md §5.
pub struct MessageAggregator {
    vcs: Arc<dyn VcsClient>,
    config: MessageConfig,
    pr: PullRequest,
    state: Mutex<AggregatorState>,
}

impl MessageAggregator {
    pub fn new(vcs: Arc<dyn VcsClient>, config: MessageConfig, pr: PullRequest) -> Arc<Self> {
        Arc::new(Self {
            vcs,
            config,
            pr,
            state: Mutex::new(AggregatorState {
                message: Message::default(),
                comment_ids: Vec::new(),
            }),
        })
    }

    /// Appends a check's result under `app_name`. Checks run concurrently;
    /// this is the only mutation point, so the per-app `Vec` stays
    /// append-only under the shared mutex.
    #[instrument(skip(self, result), fields(app = %app_name, check = %result.check_name))]
    pub async fn upsert_result(&self, app_name: &str, result: CheckResult) {
        let mut state = self.state.lock().await;
        state.message.apps.entry(app_name.to_string()).or_default().push(result);
    }

    /// Hides `app_name` from the final rendered message (the diff check's
    /// `RemoveApp` feedback), without discarding its accumulated results.
    #[instrument(skip(self))]
    pub async fn mark_deleted(&self, app_name: &str) {
        let mut state = self.state.lock().await;
        state.message.deleted.insert(app_name.to_string());
    }

    /// Takes a stable snapshot of the message (copies under the mutex,
    /// releases it, then formats), splits into length-bounded segments
    /// preserving fence balance, and posts/updates one comment per
    /// segment. Comment-update failures fall back to posting a new
    /// comment rather than ever propagating as fatal (spec.md §7).
    #[instrument(skip(self), fields(check_id = %check_id))]
    pub async fn render(&self, check_id: &str) -> Result<()> {
        let (snapshot, existing_ids) = {
            let state = self.state.lock().await;
            (state.message.clone_for_render(), state.comment_ids.clone())
        };

        let body = markdown::render_full(&snapshot);
        let anchor = format!("check {check_id}");
        let segments = markdown::split_preserving_fences(&body, self.config.max_comment_length, &anchor);

        let mut new_ids = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            if let Some(existing) = existing_ids.get(i) {
                match self.vcs.update_message(&self.pr, existing, segment).await {
                    Ok(()) => new_ids.push(existing.clone()),
                    Err(e) => {
                        warn!(error = %e, "comment update failed, falling back to a new comment");
                        let id = self.vcs.post_message(&self.pr, segment).await?;
                        new_ids.push(id);
                    }
                }
            } else {
                let id = self.vcs.post_message(&self.pr, segment).await?;
                new_ids.push(id);
            }
        }

        if new_ids.len() < existing_ids.len() {
            info!(
                dropped = existing_ids.len() - new_ids.len(),
                "fewer segments than before; leftover comments are left as last rendered"
            );
        }

        let mut state = self.state.lock().await;
        state.comment_ids = new_ids;
        Ok(())
    }
}

impl Message {
    /// A cheap deep copy for the "take a stable snapshot, release the
    /// lock, then format" discipline spec.md §5 requires of readers.
    fn clone_for_render(&self) -> Message {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeVcs {
        posted: StdMutex<Vec<String>>,
        updated: StdMutex<Vec<(String, String)>>,
        next_id: StdMutex<u32>,
    }

    impl FakeVcs {
        fn new() -> Self {
            Self {
                posted: StdMutex::new(Vec::new()),
                updated: StdMutex::new(Vec::new()),
                next_id: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl VcsClient for FakeVcs {
        async fn download_archive(&self, _pr: &PullRequest) -> Result<String> {
            unimplemented!()
        }
        fn auth_headers(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        async fn pull_request_files(&self, _pr: &PullRequest) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn post_message(&self, _pr: &PullRequest, body: &str) -> Result<String> {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            self.posted.lock().unwrap().push(body.to_string());
            Ok(format!("comment-{id}"))
        }
        async fn update_message(&self, _pr: &PullRequest, comment_id: &str, body: &str) -> Result<()> {
            self.updated.lock().unwrap().push((comment_id.to_string(), body.to_string()));
            Ok(())
        }
        fn username(&self) -> &str {
            "kubechecks-bot"
        }
        fn email(&self) -> &str {
            "kubechecks-bot@example.com"
        }
    }

    fn pr() -> PullRequest {
        PullRequest {
            provider: "github".into(),
            full_name: "org/repo".into(),
            check_id: "1".into(),
            head_sha: "abc".into(),
            base_ref: "main".into(),
            head_ref: "feature".into(),
            clone_url: "https://example.com/org/repo".into(),
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn first_render_posts_a_new_comment() {
        let vcs = Arc::new(FakeVcs::new());
        let agg = MessageAggregator::new(vcs.clone(), MessageConfig::default(), pr());
        agg.upsert_result(
            "app1",
            CheckResult {
                check_name: "diff".into(),
                state: State::Success,
                summary: "ok".into(),
                details: "no changes".into(),
                no_changes_detected: true,
            },
        )
        .await;

        agg.render("1").await.unwrap();
        assert_eq!(vcs.posted.lock().unwrap().len(), 1);
        assert!(vcs.posted.lock().unwrap()[0].contains("app1"));
    }

    #[tokio::test]
    async fn second_render_updates_the_same_comment() {
        let vcs = Arc::new(FakeVcs::new());
        let agg = MessageAggregator::new(vcs.clone(), MessageConfig::default(), pr());
        agg.upsert_result(
            "app1",
            CheckResult {
                check_name: "diff".into(),
                state: State::Running,
                summary: "running".into(),
                details: "".into(),
                no_changes_detected: false,
            },
        )
        .await;
        agg.render("1").await.unwrap();

        agg.upsert_result(
            "app1",
            CheckResult {
                check_name: "diff".into(),
                state: State::Success,
                summary: "done".into(),
                details: "".into(),
                no_changes_detected: false,
            },
        )
        .await;
        agg.render("1").await.unwrap();

        assert_eq!(vcs.posted.lock().unwrap().len(), 1);
        assert_eq!(vcs.updated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_deleted_hides_app_from_rendered_body() {
        let vcs = Arc::new(FakeVcs::new());
        let agg = MessageAggregator::new(vcs.clone(), MessageConfig::default(), pr());
        agg.upsert_result(
            "gone",
            CheckResult {
                check_name: "diff".into(),
                state: State::Success,
                summary: "ok".into(),
                details: "".into(),
                no_changes_detected: false,
            },
        )
        .await;
        agg.mark_deleted("gone").await;
        agg.render("1").await.unwrap();

        assert!(!vcs.posted.lock().unwrap()[0].contains("gone"));
    }
}
