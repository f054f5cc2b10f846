//! Core data model: pull requests, snapshots, applications, and the
//! per-PR message/result types that checks write into.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable view of a pull/merge request, created from a webhook
/// payload and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub provider: String,
    pub full_name: String,
    pub check_id: String,
    pub head_sha: String,
    pub base_ref: String,
    pub head_ref: String,
    pub clone_url: String,
    pub labels: Vec<String>,
}

impl PullRequest {
    /// Normalized clone URL, used as the git provider's cache key and as
    /// the per-repo queue key (see scheduler::repo_queue).
    pub fn normalized_clone_url(&self) -> String {
        normalize_repo_url(&self.clone_url)
    }
}

/// Lowercases scheme/host, strips a trailing `.git` and trailing slash so
/// the same physical repository always maps to the same cache/queue key.
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

/// Which provider materialized a `Snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotProviderKind {
    Git,
    Archive,
}

/// Cache key for a `Snapshot`. Git providers key by normalized clone URL;
/// archive providers key by the merge-commit SHA, which is a distinct
/// newtype precisely so a stale PR head SHA can never be substituted for
/// it (see the Open Question resolution in DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    CloneUrl(String),
    MergeCommitSha(MergeCommitSha),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeCommitSha(pub String);

/// Provider-specific state attached to a materialized snapshot.
#[derive(Debug, Clone, Default)]
pub struct GitSnapshotState {
    pub base_branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveSnapshotState {
    pub top_level_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProviderState {
    Git(GitSnapshotState),
    Archive(ArchiveSnapshotState),
}

/// A ref-counted, TTL-evicted materialized repository. Owned exclusively
/// by `cache::SnapshotCache`; never handed out by reference.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: CacheKey,
    pub extracted_path: std::path::PathBuf,
    pub ref_count: i64,
    pub last_used: DateTime<Utc>,
    pub provider_state: ProviderState,
}

/// A thin, per-acquisition view of a `Snapshot` handed to callers by
/// `SnapshotCache::acquire`. For the git provider each acquisition gets a
/// freshly minted, uniquely named `temp_branch`; the archive provider
/// never sets one, since archive snapshots are immutable.
#[derive(Debug, Clone)]
pub struct RepoHandle {
    pub key: CacheKey,
    pub directory: std::path::PathBuf,
    pub base_branch: String,
    pub temp_branch: Option<String>,
}

/// A single source within an `Application`. `ref_name` is populated iff
/// this source is a "ref" source (addressable as `$refName/path`, never a
/// content source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub repo_url: String,
    pub target_revision: String,
    pub path: String,
    pub helm: Option<HelmSource>,
    pub kustomize: Option<KustomizeSource>,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
}

impl Source {
    pub fn is_ref(&self) -> bool {
        self.ref_name.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelmSource {
    #[serde(default)]
    pub value_files: Vec<String>,
    #[serde(default)]
    pub ignore_missing_value_files: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KustomizeSource {
    #[serde(default)]
    pub enabled: bool,
}

/// An application as reported by the deployment-platform informer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub project: String,
    pub destination: String,
    pub sources: Vec<Source>,
}

impl Application {
    /// The single implicit source used when `sources` is empty. Panics if
    /// called on a multi-source application; callers must branch on
    /// `sources.is_empty()` first.
    pub fn implicit_source(&self) -> Option<&Source> {
        if self.sources.len() == 1 {
            self.sources.first()
        } else {
            None
        }
    }

    /// Splits `sources` into the (at most one) content source and the
    /// remaining ref sources.
    pub fn split_sources(&self) -> (Option<&Source>, Vec<&Source>) {
        let mut content = None;
        let mut refs = Vec::new();
        for s in &self.sources {
            if s.is_ref() {
                refs.push(s);
            } else if content.is_none() {
                content = Some(s);
            } else {
                refs.push(s);
            }
        }
        (content, refs)
    }
}

/// The projection of an `Application` stored in `AppIndex`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationStub {
    pub name: String,
    pub path: String,
    pub is_helm: bool,
    pub is_kustomize: bool,
    pub target_revision: String,
}

impl ApplicationStub {
    /// Whether this app's source targets `base_ref`, directly or via the
    /// implicit `HEAD` alias on a default branch.
    pub fn should_include(&self, base_ref: &str) -> bool {
        if self.target_revision.is_empty() || self.target_revision == base_ref {
            return true;
        }
        self.target_revision == "HEAD" && matches!(base_ref, "main" | "master")
    }
}

/// Reverse index: which applications does a changed file/directory
/// affect? Keyed per normalized repository URL by the caller
/// (`appindex::AppIndex` owns one instance per repo).
#[derive(Debug, Clone, Default)]
pub struct RepoAppIndex {
    pub apps_by_name: HashMap<String, ApplicationStub>,
    pub dir_to_apps: HashMap<String, HashSet<String>>,
    pub file_to_apps: HashMap<String, HashSet<String>>,
}

/// The total order of check/app/PR aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    None,
    Success,
    Skip,
    Running,
    Warning,
    Failure,
    Error,
    Panic,
}

impl State {
    /// Whether this state is excluded from an aggregate-state computation,
    /// which takes the max of non-skipped, non-no-changes-detected results.
    pub fn counts_toward_aggregate(&self) -> bool {
        !matches!(self, State::Skip)
    }

    pub fn to_emoji(self) -> &'static str {
        match self {
            State::None => "",
            State::Success => "✅",
            State::Skip => "⏭️",
            State::Running => "🔄",
            State::Warning => "⚠️",
            State::Failure => "❌",
            State::Error => "💥",
            State::Panic => "🆘",
        }
    }

    pub fn to_word(self) -> &'static str {
        match self {
            State::None => "none",
            State::Success => "succeeded",
            State::Skip => "skipped",
            State::Running => "running",
            State::Warning => "warning",
            State::Failure => "failed",
            State::Error => "errored",
            State::Panic => "panicked",
        }
    }
}

/// A single check's outcome against one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub state: State,
    pub summary: String,
    pub details: String,
    pub no_changes_detected: bool,
}

impl CheckResult {
    pub fn counts_toward_aggregate(&self) -> bool {
        self.state.counts_toward_aggregate() && !self.no_changes_detected
    }
}

/// The per-PR aggregated message that `MessageAggregator` owns and
/// `markdown::render` turns into wire text.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub apps: HashMap<String, Vec<CheckResult>>,
    pub deleted: HashSet<String>,
}

impl Message {
    /// Aggregate state of a single app: max of its counted results, or
    /// `State::None` if it has none.
    pub fn app_state(&self, app: &str) -> State {
        self.apps
            .get(app)
            .into_iter()
            .flatten()
            .filter(|r| r.counts_toward_aggregate())
            .map(|r| r.state)
            .max()
            .unwrap_or(State::None)
    }

    /// Aggregate state across all non-deleted apps.
    pub fn pr_state(&self) -> State {
        self.apps
            .keys()
            .filter(|name| !self.deleted.contains(*name))
            .map(|name| self.app_state(name))
            .max()
            .unwrap_or(State::None)
    }
}
