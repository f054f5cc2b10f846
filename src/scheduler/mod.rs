//! CheckScheduler: two-level scheduling — a per-repo FIFO
//! queue (`repo_queue`) serializing all checks against a given clone URL,
//! and a global semaphore bounding the *(app × check)* fan-out.

pub mod repo_queue;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, instrument, warn};

use crate::aggregator::MessageAggregator;
use crate::appindex::AppIndex;
use crate::cache::{FetchOutcome, SnapshotCache};
use crate::checks::{Check, RenderedManifestStore};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::packager::AppPackager;
use crate::platform::DeploymentPlatform;
use crate::providers::archive::{extract_merge_commit_sha, ArchiveSnapshotProvider};
use crate::providers::git::GitSnapshotProvider;
use crate::renderer::{RenderRequest, Renderer};
use crate::types::{
    ApplicationStub, ArchiveSnapshotState, CacheKey, GitSnapshotState, ProviderState, PullRequest, RepoHandle,
};
use crate::vcs::VcsClient;

use self::repo_queue::{spawn_repo_actor, QueueEntry, RepoQueue};

/// Feedback callback the diff check uses to queue newly discovered child
/// applications into the same run, or hide removed ones from the final
/// message — checks stay pure functions of their inputs rather than
/// mutating the scheduler directly.
#[derive(Clone)]
pub struct ChildAppFeedback {
    tx: mpsc::UnboundedSender<ChildAppEvent>,
}

pub enum ChildAppEvent {
    QueueApp(ApplicationStub),
    RemoveApp(String),
}

impl ChildAppFeedback {
    pub fn new(tx: mpsc::UnboundedSender<ChildAppEvent>) -> Self {
        Self { tx }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test(tx: mpsc::UnboundedSender<ChildAppEvent>) -> Self {
        Self::new(tx)
    }

    pub fn queue_app(&self, stub: ApplicationStub) {
        let _ = self.tx.send(ChildAppEvent::QueueApp(stub));
    }

    pub fn remove_app(&self, name: String) {
        let _ = self.tx.send(ChildAppEvent::RemoveApp(name));
    }
}

/// Collaborators + render context a caller of `enqueue` supplies for one
/// check run — the same shape `MessageAggregator::new` already takes a
/// `vcs` client from its caller, since the concrete VCS/deployment-platform
/// clients are out-of-scope collaborators this crate only fixes contracts
/// for.
pub struct PipelineDeps {
    pub vcs: Arc<dyn VcsClient>,
    pub platform: Arc<dyn DeploymentPlatform>,
    pub renderer: Arc<dyn Renderer>,
    pub manifest_store: Arc<RenderedManifestStore>,
    pub kubernetes_version: String,
    pub api_versions: Vec<String>,
    pub helm_repositories: Vec<String>,
}

/// Which provider materialized the repo for one PR check, and what it
/// takes to release it again. Archive snapshots go through `SnapshotCache`
/// (immutable, shareable by merge-commit sha); git snapshots bypass the
/// cache entirely since each PR needs its own merge onto a fresh temp
/// branch off a single mutable working copy.
enum Materialization {
    Archive { key: CacheKey },
    Git { handle: RepoHandle },
}

struct Materialized {
    base_dir: PathBuf,
    changed_files: Vec<String>,
    kind: Materialization,
}

pub struct CheckScheduler {
    config: SchedulerConfig,
    repo_queues: tokio::sync::Mutex<HashMap<String, (Arc<RepoQueue>, mpsc::Sender<()>)>>,
    semaphore: Arc<Semaphore>,
    pub app_index: Arc<AppIndex>,
    pub cache: Arc<SnapshotCache>,
    git_provider: Arc<GitSnapshotProvider>,
    archive_provider: Arc<ArchiveSnapshotProvider>,
    archive_mode: bool,
}

impl CheckScheduler {
    pub fn new(
        config: SchedulerConfig,
        app_index: Arc<AppIndex>,
        cache: Arc<SnapshotCache>,
        git_provider: Arc<GitSnapshotProvider>,
        archive_provider: Arc<ArchiveSnapshotProvider>,
        archive_mode: bool,
    ) -> Arc<Self> {
        let max_concurrent_checks = config.max_concurrent_checks;
        Arc::new(Self {
            config,
            repo_queues: tokio::sync::Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_checks)),
            app_index,
            cache,
            git_provider,
            archive_provider,
            archive_mode,
        })
    }

    /// Pre-enqueue label-filter gate: if configured, a PR must carry at
    /// least one listed label to be processed at all.
    pub fn passes_label_filter(&self, pr: &PullRequest) -> bool {
        if self.config.label_filter.is_empty() {
            return true;
        }
        pr.labels.iter().any(|l| self.config.label_filter.contains(l))
    }

    /// Enqueues a PR check on its repo's FIFO queue, lazily spawning that
    /// repo's actor task if this is the first work seen for it.
    #[instrument(skip(self, pr, aggregator, checks, deps))]
    pub async fn enqueue<C>(
        self: &Arc<Self>,
        pr: PullRequest,
        aggregator: Arc<MessageAggregator>,
        checks: Arc<Vec<C>>,
        deps: Arc<PipelineDeps>,
    ) -> Result<()>
    where
        C: Check + 'static,
    {
        if !self.passes_label_filter(&pr) {
            info!(check_id = %pr.check_id, "PR excluded by label-filter");
            return Ok(());
        }

        let repo_url = pr.normalized_clone_url();
        let (queue, wake_tx) = {
            let mut queues = self.repo_queues.lock().await;
            if let Some(existing) = queues.get(&repo_url) {
                existing.clone()
            } else {
                let queue = RepoQueue::new(self.config.max_queue_size, self.config.replan_policy);
                let (wake_tx, wake_rx) = mpsc::channel(1);
                let shutdown = tokio_util::sync::CancellationToken::new();
                let scheduler = self.clone();
                let actor_queue = queue.clone();
                spawn_repo_actor(actor_queue, wake_rx, shutdown, move |entry: QueueEntry| {
                    let scheduler = scheduler.clone();
                    let aggregator = aggregator.clone();
                    let checks = checks.clone();
                    let deps = deps.clone();
                    async move {
                        scheduler.run_pr_check(entry, aggregator, checks, deps).await;
                    }
                });
                queues.insert(repo_url.clone(), (queue.clone(), wake_tx.clone()));
                (queue, wake_tx)
            }
        };

        queue.enqueue(pr).await?;
        let _ = wake_tx.try_send(());
        Ok(())
    }

    /// Materializes the repo for `pr`: archive-via-cache when
    /// `archive_mode` is set, otherwise a direct git-provider merge that
    /// bypasses `SnapshotCache` (see `Materialization`'s doc comment).
    /// Returns the real changed-files list the provider observed.
    #[instrument(skip(self, pr, deps))]
    async fn materialize(&self, pr: &PullRequest, deps: &PipelineDeps) -> Result<Materialized> {
        if self.archive_mode {
            let archive_url = deps.vcs.download_archive(pr).await?;
            let sha = extract_merge_commit_sha(&archive_url)?;
            let key = CacheKey::MergeCommitSha(sha);
            let archive_provider = self.archive_provider.clone();
            let auth_headers = deps.vcs.auth_headers();
            let url = archive_url.clone();
            let outcome = self
                .cache
                .acquire(key.clone(), move || async move {
                    let (path, _top_level) = archive_provider.acquire(&url, &auth_headers).await?;
                    Ok(FetchOutcome {
                        extracted_path: path,
                        provider_state: ProviderState::Archive(ArchiveSnapshotState::default()),
                    })
                })
                .await?;

            let changed_files = deps.vcs.pull_request_files(pr).await?;
            Ok(Materialized {
                base_dir: outcome.extracted_path,
                changed_files,
                kind: Materialization::Archive { key },
            })
        } else {
            let nano_timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let (handle, _state) = self.git_provider.acquire(pr, nano_timestamp).await?;
            let changed_files = self.git_provider.changed_files(&handle).await?;
            let base_dir = handle.directory.clone();
            Ok(Materialized {
                base_dir,
                changed_files,
                kind: Materialization::Git { handle },
            })
        }
    }

    async fn release_materialized(&self, materialized: &Materialized) {
        match &materialized.kind {
            Materialization::Archive { key } => {
                self.archive_provider.release().await;
                self.cache.release(key).await;
            }
            Materialization::Git { handle } => {
                self.git_provider.release(handle).await;
            }
        }
    }

    /// Materializes whatever repository a ref source's `repoURL` points at
    /// (possibly not the repo under check), for the packager's step 5
    /// ref-value-file resolution. Always goes through `SnapshotCache`
    /// keyed by clone URL, since ref repos are read-only lookups with no
    /// per-PR merge involved.
    async fn resolve_ref_repo(self: &Arc<Self>, repo_url: String) -> Result<PathBuf> {
        let key = CacheKey::CloneUrl(crate::types::normalize_repo_url(&repo_url));
        let git_provider = self.git_provider.clone();
        let fetch_url = repo_url.clone();
        let outcome = self
            .cache
            .acquire(key.clone(), move || async move {
                let dir = git_provider.ensure_cloned(&fetch_url).await?;
                Ok(FetchOutcome {
                    extracted_path: dir,
                    provider_state: ProviderState::Git(GitSnapshotState::default()),
                })
            })
            .await?;
        self.cache.release(&key).await;
        Ok(outcome.extracted_path)
    }

    /// Packages `stub`'s application into a temp tree, compresses it, and
    /// renders it, storing the resulting manifests in `deps.manifest_store`
    /// for the checks that run afterward (§4.8's per-app "package → render
    /// → run each check" sequence).
    async fn package_and_render(
        self: &Arc<Self>,
        stub: &ApplicationStub,
        pr: &PullRequest,
        base_dir: &Path,
        deps: &PipelineDeps,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        let app = deps.platform.get_application(&stub.name).await?;

        let scheduler = self.clone();
        let tree = AppPackager
            .package(&app, pr, base_dir, move |repo_url| {
                let scheduler = scheduler.clone();
                async move { scheduler.resolve_ref_repo(repo_url).await }
            })
            .await?;
        let bundle = tree.compress()?;

        let (_content, refs) = app.split_sources();
        let ref_source_map = refs
            .iter()
            .filter_map(|r| r.ref_name.clone().map(|name| (name, r.target_revision.clone())))
            .collect();

        let sources = if app.sources.is_empty() {
            app.implicit_source().cloned().into_iter().collect()
        } else {
            AppPackager::transform_ref_sources(&app, pr)
        };

        let req = RenderRequest {
            app_name: stub.name.clone(),
            sources,
            kubernetes_version: deps.kubernetes_version.clone(),
            api_versions: deps.api_versions.clone(),
            helm_repositories: deps.helm_repositories.clone(),
            ref_source_map,
        };

        let manifests = deps.renderer.render(&req, &bundle, cancel).await?;
        deps.manifest_store.set(&stub.name, manifests).await;
        Ok(())
    }

    /// One fully dequeued PR check: materializes the repo, finds affected
    /// apps, then fans each app out across the semaphore-bounded check set.
    /// On completion, posts/updates the aggregated comment and releases the
    /// snapshot.
    #[instrument(skip(self, entry, aggregator, checks, deps))]
    async fn run_pr_check<C>(
        self: &Arc<Self>,
        entry: QueueEntry,
        aggregator: Arc<MessageAggregator>,
        checks: Arc<Vec<C>>,
        deps: Arc<PipelineDeps>,
    ) where
        C: Check + 'static,
    {
        let QueueEntry { pr, cancel } = entry;
        let repo_url = pr.normalized_clone_url();

        let materialized = match self.materialize(&pr, &deps).await {
            Ok(m) => m,
            Err(e) => {
                warn!(check_id = %pr.check_id, error = %e, "failed to materialize snapshot");
                let _ = aggregator.render(&pr.check_id).await;
                return;
            }
        };

        let affected = self.app_index.find_affected(&repo_url, &materialized.changed_files).await;

        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let feedback = ChildAppFeedback { tx: feedback_tx };

        let mut worklist: Vec<ApplicationStub> = affected;
        let mut seen: std::collections::HashSet<String> = worklist.iter().map(|s| s.name.clone()).collect();

        loop {
            let mut handles = Vec::new();
            for stub in worklist.drain(..) {
                if cancel.is_cancelled() {
                    break;
                }
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let checks = checks.clone();
                let aggregator = aggregator.clone();
                let feedback = feedback.clone();
                let stub = stub.clone();
                let scheduler = self.clone();
                let deps = deps.clone();
                let pr = pr.clone();
                let base_dir = materialized.base_dir.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = scheduler.package_and_render(&stub, &pr, &base_dir, &deps, &cancel).await {
                        warn!(app = %stub.name, error = %e, "packaging/render failed");
                        aggregator
                            .upsert_result(
                                &stub.name,
                                crate::types::CheckResult {
                                    check_name: "render".into(),
                                    state: crate::types::State::Error,
                                    summary: "failed to package or render manifests".into(),
                                    details: e.to_string(),
                                    no_changes_detected: false,
                                },
                            )
                            .await;
                        return;
                    }
                    for check in checks.iter() {
                        let result = check.run(&stub, &feedback).await;
                        aggregator.upsert_result(&stub.name, result).await;
                    }
                }));
            }
            for h in handles {
                let _ = h.await;
            }

            feedback_rx.close();
            let mut next_round = Vec::new();
            while let Ok(event) = feedback_rx.try_recv() {
                match event {
                    ChildAppEvent::QueueApp(stub) => {
                        if seen.insert(stub.name.clone()) {
                            next_round.push(stub);
                        }
                    }
                    ChildAppEvent::RemoveApp(name) => {
                        aggregator.mark_deleted(&name).await;
                    }
                }
            }
            if next_round.is_empty() {
                break;
            }
            worklist = next_round;
        }

        if cancel.is_cancelled() {
            warn!(check_id = %pr.check_id, "PR check cancelled mid-flight");
        }

        self.release_materialized(&materialized).await;
        deps.manifest_store.clear().await;
        let _ = aggregator.render(&pr.check_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::SnapshotCache;
    use crate::config::SchedulerConfig;
    use crate::platform::{ClusterInfo, ManagedResource, PlatformSettings};
    use crate::types::{Application, HelmSource, Source};

    struct FakeVcs;

    #[async_trait]
    impl VcsClient for FakeVcs {
        async fn download_archive(&self, _pr: &PullRequest) -> Result<String> {
            unimplemented!("not exercised in git-mode tests")
        }
        fn auth_headers(&self) -> StdHashMap<String, String> {
            StdHashMap::new()
        }
        async fn pull_request_files(&self, _pr: &PullRequest) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn post_message(&self, _pr: &PullRequest, _body: &str) -> Result<String> {
            Ok("comment-1".into())
        }
        async fn update_message(&self, _pr: &PullRequest, _comment_id: &str, _body: &str) -> Result<()> {
            Ok(())
        }
        fn username(&self) -> &str {
            "kubechecks-bot"
        }
        fn email(&self) -> &str {
            "kubechecks-bot@example.com"
        }
    }

    struct FakePlatform {
        app: Application,
    }

    #[async_trait]
    impl DeploymentPlatform for FakePlatform {
        async fn list_applications(&self) -> Result<Vec<Application>> {
            Ok(vec![self.app.clone()])
        }
        async fn get_application(&self, name: &str) -> Result<Application> {
            if name == self.app.name {
                Ok(self.app.clone())
            } else {
                Err(crate::error::Error::NotFound(name.to_string()))
            }
        }
        async fn list_managed_resources(&self, _app_name: &str) -> Result<Vec<ManagedResource>> {
            Ok(vec![])
        }
        async fn get_cluster(&self, _query: &str) -> Result<ClusterInfo> {
            Ok(ClusterInfo::default())
        }
        async fn get_settings(&self) -> Result<PlatformSettings> {
            Ok(PlatformSettings::default())
        }
    }

    struct FakeRenderer {
        manifests: Vec<String>,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(
            &self,
            _req: &RenderRequest,
            _bundle: &[u8],
            _cancel: &tokio_util::sync::CancellationToken,
        ) -> Result<Vec<String>> {
            Ok(self.manifests.clone())
        }
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git subprocess must be available on PATH for this test");
        assert!(output.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A `main`/`testing` pair where `testing` adds `app1/extra.yaml` on
    /// top of a shared `app1/` directory already on `main`.
    fn init_origin_with_app1(dir: &Path) -> String {
        git(dir, &["init", "--initial-branch=main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "test"]);

        std::fs::create_dir_all(dir.join("app1")).unwrap();
        std::fs::write(dir.join("app1/base.yaml"), "kind: ConfigMap\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "app1 base"]);

        git(dir, &["checkout", "-b", "testing"]);
        std::fs::write(dir.join("app1/extra.yaml"), "kind: ConfigMap\nname: extra\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "app1 extra"]);

        git(dir, &["rev-parse", "HEAD"])
    }

    fn scheduler_with_git_provider(cache_root: &Path, archive_cache_root: &Path) -> Arc<CheckScheduler> {
        CheckScheduler::new(
            SchedulerConfig::default(),
            Arc::new(AppIndex::new()),
            SnapshotCache::new(Duration::from_secs(3600)),
            Arc::new(GitSnapshotProvider::new(cache_root.to_path_buf(), false)),
            Arc::new(ArchiveSnapshotProvider::new(archive_cache_root.to_path_buf())),
            false,
        )
    }

    fn app1_source(repo_url: &str) -> Application {
        Application {
            name: "app1".into(),
            project: "default".into(),
            destination: "in-cluster".into(),
            sources: vec![Source {
                repo_url: repo_url.to_string(),
                target_revision: "main".into(),
                path: "app1".into(),
                helm: Some(HelmSource::default()),
                kustomize: None,
                ref_name: None,
            }],
        }
    }

    #[tokio::test]
    async fn materialize_in_git_mode_returns_provider_changed_files() {
        let origin_dir = tempfile::tempdir().unwrap();
        let head_sha = init_origin_with_app1(origin_dir.path());

        let cache_root = tempfile::tempdir().unwrap();
        let archive_root = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with_git_provider(cache_root.path(), archive_root.path());

        let deps = PipelineDeps {
            vcs: Arc::new(FakeVcs),
            platform: Arc::new(FakePlatform {
                app: app1_source(&origin_dir.path().to_string_lossy()),
            }),
            renderer: Arc::new(FakeRenderer { manifests: vec![] }),
            manifest_store: RenderedManifestStore::new(),
            kubernetes_version: "1.28".into(),
            api_versions: vec![],
            helm_repositories: vec![],
        };

        let pr = PullRequest {
            provider: "test".into(),
            full_name: "org/repo".into(),
            check_id: "1".into(),
            head_sha,
            base_ref: "main".into(),
            head_ref: "testing".into(),
            clone_url: origin_dir.path().to_string_lossy().to_string(),
            labels: vec![],
        };

        let materialized = scheduler.materialize(&pr, &deps).await.unwrap();
        let mut changed = materialized.changed_files.clone();
        changed.sort();
        assert_eq!(changed, vec!["app1/extra.yaml".to_string()]);
        assert!(materialized.base_dir.join("app1/base.yaml").exists());

        scheduler.release_materialized(&materialized).await;
    }

    #[tokio::test]
    async fn package_and_render_stores_manifests_for_app() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("app1")).unwrap();
        std::fs::write(base.path().join("app1/base.yaml"), "kind: ConfigMap\n").unwrap();

        let cache_root = tempfile::tempdir().unwrap();
        let archive_root = tempfile::tempdir().unwrap();
        let scheduler = scheduler_with_git_provider(cache_root.path(), archive_root.path());

        let manifest_store = RenderedManifestStore::new();
        let deps = PipelineDeps {
            vcs: Arc::new(FakeVcs),
            platform: Arc::new(FakePlatform {
                app: app1_source("https://example.com/org/repo"),
            }),
            renderer: Arc::new(FakeRenderer {
                manifests: vec!["kind: ConfigMap\nmetadata:\n  name: rendered\n".to_string()],
            }),
            manifest_store: manifest_store.clone(),
            kubernetes_version: "1.28".into(),
            api_versions: vec!["v1".into()],
            helm_repositories: vec![],
        };

        let stub = ApplicationStub {
            name: "app1".into(),
            path: "app1".into(),
            is_helm: true,
            is_kustomize: false,
            target_revision: "main".into(),
        };
        let pr = PullRequest {
            provider: "test".into(),
            full_name: "org/repo".into(),
            check_id: "1".into(),
            head_sha: "abc".into(),
            base_ref: "main".into(),
            head_ref: "feature".into(),
            clone_url: "https://example.com/org/repo".into(),
            labels: vec![],
        };
        let cancel = tokio_util::sync::CancellationToken::new();

        scheduler
            .package_and_render(&stub, &pr, base.path(), &deps, &cancel)
            .await
            .unwrap();

        let manifests = manifest_store.manifests_for("app1").await.unwrap();
        assert_eq!(manifests, vec!["kind: ConfigMap\nmetadata:\n  name: rendered\n".to_string()]);
    }
}
