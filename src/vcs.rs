//! `VcsClient`: the narrow code-hosting capability set this core
//! consumes (spec.md §6). The webhook receiver and the concrete
//! GitHub/GitLab/Bitbucket clients are collaborators, out of scope; this
//! module only fixes the contract they must satisfy.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PullRequest, State};

/// Narrow capability set consumed by the snapshot providers, the
/// packager's ref-source resolution, and `MessageAggregator`.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Requests a signed, pre-merged archive URL for `pr`. Must fail with
    /// `Error::NotMergeable` when the remote reports the PR cannot be
    /// merged cleanly.
    async fn download_archive(&self, pr: &PullRequest) -> Result<String>;

    /// Headers (e.g. `Authorization`) to attach to the archive download
    /// and any other authenticated request this client makes.
    fn auth_headers(&self) -> HashMap<String, String>;

    /// Files changed by `pr` relative to its base, used by the archive
    /// provider in place of `git diff`.
    async fn pull_request_files(&self, pr: &PullRequest) -> Result<Vec<String>>;

    /// Posts a brand-new top-level comment, returning its id.
    async fn post_message(&self, pr: &PullRequest, body: &str) -> Result<String>;

    /// Updates an existing comment in place.
    async fn update_message(&self, pr: &PullRequest, comment_id: &str, body: &str) -> Result<()>;

    /// Provider-specific emoji for a state (defaults to the shared table
    /// in `types::State`; providers with custom reaction sets can
    /// override).
    fn to_emoji(&self, state: State) -> &'static str {
        state.to_emoji()
    }

    /// Git identity used when committing to temp branches (GitSnapshotProvider
    /// does not commit, but merges may need an identity configured upstream
    /// of this client, per spec.md's `$HOME/.git-credentials` note).
    fn username(&self) -> &str;
    fn email(&self) -> &str;
}
