//! GitSnapshotProvider: persistent local working copies with per-PR
//! isolation branches, subprocess-driven via `tokio::process::Command`.
//! Cache directories are keyed by an MD5 hash of the clone URL.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tokio::process::Command;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::types::{GitSnapshotState, PullRequest, RepoHandle};

/// Sanitizes a ref/SHA fragment for use in a git branch name: replace
/// ` / \ : ~ ^ ? * [ ]` with `-`, collapse runs, trim leading/trailing `-`.
pub fn sanitize_branch_component(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|c| {
            if " /\\:~^?*[]".contains(c) {
                '-'
            } else {
                c
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    let mut last_dash = false;
    for c in replaced.chars() {
        if c == '-' {
            if !last_dash {
                collapsed.push(c);
            }
            last_dash = true;
        } else {
            collapsed.push(c);
            last_dash = false;
        }
    }
    collapsed.trim_matches('-').to_string()
}

pub fn temp_branch_name(nano_timestamp: i64, head_sha: &str) -> String {
    let short_sha = &head_sha[..head_sha.len().min(7)];
    format!(
        "temp-pr-{}-{}",
        nano_timestamp,
        sanitize_branch_component(short_sha)
    )
}

pub struct GitSnapshotProvider {
    pub cache_root: PathBuf,
    pub shallow: bool,
}

impl GitSnapshotProvider {
    pub fn new(cache_root: PathBuf, shallow: bool) -> Self {
        Self { cache_root, shallow }
    }

    /// Stable per-repo subdirectory name: `md5(normalized clone url)`.
    pub fn working_copy_dir(&self, normalized_clone_url: &str) -> PathBuf {
        let mut hasher = Md5::new();
        hasher.update(normalized_clone_url.as_bytes());
        let digest = hasher.finalize();
        self.cache_root.join(format!("{digest:x}"))
    }

    async fn run_git(&self, dir: &Path, args: &[&str], context: &str) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| Error::transient_io(context.to_string(), e))?;
        if !output.status.success() {
            return Err(Error::TransientIo {
                context: format!(
                    "{context}: git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr)
                ),
                source: std::io::Error::new(std::io::ErrorKind::Other, "git command failed"),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Clones `clone_url` into its stable working-copy directory if absent,
    /// fetching otherwise, and returns that directory without touching
    /// which ref is checked out. Used to resolve `ref` sources pointing at
    /// a repository other than the one under check, where there is no PR
    /// to merge — just a fixed revision to read files out of.
    pub async fn ensure_cloned(&self, clone_url: &str) -> Result<PathBuf> {
        let dir = self.working_copy_dir(&crate::types::normalize_repo_url(clone_url));
        if !dir.join(".git").exists() {
            self.clone_fresh(clone_url, &dir).await?;
        } else {
            self.run_git(&dir, &["fetch", "origin"], "fetch origin").await?;
        }
        Ok(dir)
    }

    /// Clones if absent, fetches and hard-resets to base, creates and
    /// checks out a fresh temp branch, then merges the PR head into it.
    #[instrument(skip(self, pr), fields(repo = %pr.full_name))]
    pub async fn acquire(&self, pr: &PullRequest, nano_timestamp: i64) -> Result<(RepoHandle, GitSnapshotState)> {
        let dir = self.working_copy_dir(&pr.normalized_clone_url());

        if !dir.join(".git").exists() {
            self.clone_fresh(&pr.clone_url, &dir).await?;
        }

        self.run_git(&dir, &["fetch", "origin"], "fetch origin").await?;
        self.run_git(
            &dir,
            &["reset", "--hard", &format!("origin/{}", pr.base_ref)],
            "hard reset to base",
        )
        .await?;

        let temp_branch = temp_branch_name(nano_timestamp, &pr.head_sha);
        self.run_git(
            &dir,
            &["checkout", "-b", &temp_branch, &format!("origin/{}", pr.base_ref)],
            "create temp branch",
        )
        .await?;

        if self.shallow {
            self.run_git(
                &dir,
                &[
                    "fetch",
                    "origin",
                    &format!("{}:head", pr.head_ref),
                    "--depth",
                    "1",
                ],
                "shallow fetch head",
            )
            .await?;
            self.run_git(
                &dir,
                &["merge", "--allow-unrelated-histories", "-X", "theirs", "head"],
                "merge head (shallow)",
            )
            .await?;
        } else {
            self.run_git(&dir, &["fetch", "origin", &pr.head_ref], "fetch head").await?;
            self.run_git(&dir, &["merge", "FETCH_HEAD"], "merge head").await?;
        }

        Ok((
            RepoHandle {
                key: crate::types::CacheKey::CloneUrl(pr.normalized_clone_url()),
                directory: dir,
                base_branch: pr.base_ref.clone(),
                temp_branch: Some(temp_branch),
            },
            GitSnapshotState {
                base_branch: pr.base_ref.clone(),
            },
        ))
    }

    async fn clone_fresh(&self, clone_url: &str, dest: &Path) -> Result<()> {
        let tmp_dest = dest.with_extension("cloning");
        if tmp_dest.exists() {
            let _ = std::fs::remove_dir_all(&tmp_dest);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::transient_io("creating cache root", e))?;
        }

        let mut args: Vec<&str> = vec!["clone"];
        if self.shallow {
            args.extend(["--depth", "1"]);
        }
        args.push(clone_url);
        args.push(tmp_dest.to_str().unwrap_or_default());

        let output = Command::new("git")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::transient_io("clone", e))?;
        if !output.status.success() {
            return Err(Error::TransientIo {
                context: format!("clone failed: {}", String::from_utf8_lossy(&output.stderr)),
                source: std::io::Error::new(std::io::ErrorKind::Other, "git clone failed"),
            });
        }

        if self.shallow {
            let _ = Command::new("git")
                .args(["remote", "set-branches", "origin", "*"])
                .current_dir(&tmp_dest)
                .output()
                .await;
        }

        std::fs::rename(&tmp_dest, dest).map_err(|e| Error::transient_io("renaming clone into place", e))?;
        Ok(())
    }

    /// Checks out base and deletes the temp branch with `-D`. Errors are
    /// logged, never propagated — a failed cleanup should not fail the PR
    /// check that already completed.
    #[instrument(skip(self, handle))]
    pub async fn release(&self, handle: &RepoHandle) {
        if let Some(temp_branch) = &handle.temp_branch {
            if let Err(e) = self
                .run_git(&handle.directory, &["checkout", &handle.base_branch], "checkout base")
                .await
            {
                warn!(error = %e, "failed checking out base branch during release");
            }
            if let Err(e) = self
                .run_git(&handle.directory, &["branch", "-D", temp_branch], "delete temp branch")
                .await
            {
                warn!(error = %e, "failed deleting temp branch during release");
            }
        }
    }

    /// Files changed by the PR relative to base.
    pub async fn changed_files(&self, handle: &RepoHandle) -> Result<Vec<String>> {
        let out = self
            .run_git(
                &handle.directory,
                &[
                    "diff",
                    "--name-only",
                    &format!("origin/{}...HEAD", handle.base_branch),
                ],
                "diff name-only",
            )
            .await?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }
}
