//! ArchiveSnapshotProvider: pre-merged tarball/zip fetch and extraction,
//! cache-keyed by the merge-commit SHA rather than the PR head SHA.

use std::io::Read;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::types::MergeCommitSha;

const MAX_ERROR_BODY_BYTES: usize = 500;

/// Extracts the merge-commit SHA from a signed archive URL: the fragment
/// after `/archive/` with the extension stripped, or the `sha` query
/// parameter.
pub fn extract_merge_commit_sha(archive_url: &str) -> Result<MergeCommitSha> {
    if let Some(idx) = archive_url.find("/archive/") {
        let rest = &archive_url[idx + "/archive/".len()..];
        let rest = rest.split(['?', '#']).next().unwrap_or(rest);
        let sha = rest.rsplit_once('.').map(|(base, _ext)| base).unwrap_or(rest);
        if !sha.is_empty() {
            return Ok(MergeCommitSha(sha.to_string()));
        }
    }

    if let Some(q_idx) = archive_url.find('?') {
        let query = &archive_url[q_idx + 1..];
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == "sha" && !v.is_empty() {
                    return Ok(MergeCommitSha(v.to_string()));
                }
            }
        }
    }

    Err(Error::Validation(format!(
        "could not extract merge commit sha from archive url: {archive_url}"
    )))
}

pub struct ArchiveSnapshotProvider {
    pub cache_root: PathBuf,
    client: reqwest::Client,
}

impl ArchiveSnapshotProvider {
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            client: reqwest::Client::new(),
        }
    }

    /// Downloads `archive_url` with `auth_headers`, validates the status
    /// (200 only), streams into a temp file, extracts as a ZIP into
    /// `<cache_root>/<sha>/`, rejecting any entry whose cleaned path
    /// escapes the target root (Zip-Slip protection).
    #[instrument(skip(self, auth_headers))]
    pub async fn acquire(
        &self,
        archive_url: &str,
        auth_headers: &std::collections::HashMap<String, String>,
    ) -> Result<(PathBuf, Option<String>)> {
        let sha = extract_merge_commit_sha(archive_url)?;
        let target_root = self.cache_root.join(&sha.0);
        if target_root.exists() {
            let top_level = find_single_top_level_dir(&target_root)?;
            return Ok((top_level.unwrap_or(target_root), None));
        }

        let mut req = self.client.get(archive_url);
        for (k, v) in auth_headers {
            req = req.header(k, v);
        }
        let resp = req.send().await?;

        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(MAX_ERROR_BODY_BYTES).collect();
            return Err(Error::TransientIo {
                context: format!("archive download {archive_url} returned {status}: {snippet}"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "non-200 archive response"),
            });
        }

        let tmp_file = tempfile_path(&self.cache_root, &sha.0);
        if let Some(parent) = tmp_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::transient_io("creating archive cache root", e))?;
        }

        {
            let mut file = tokio::fs::File::create(&tmp_file)
                .await
                .map_err(|e| Error::transient_io("creating temp archive file", e))?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::transient_io("writing archive chunk", e))?;
            }
            file.flush().await.map_err(|e| Error::transient_io("flushing archive file", e))?;
        }

        extract_zip(&tmp_file, &target_root)?;
        let _ = std::fs::remove_file(&tmp_file);

        let top_level = find_single_top_level_dir(&target_root)?;
        Ok((top_level.unwrap_or(target_root), Some(sha.0)))
    }

    /// Archives are immutable; release is ref-counting only (handled by
    /// `SnapshotCache`), never a no-op disk operation.
    pub async fn release(&self) {}
}

fn tempfile_path(root: &Path, sha: &str) -> PathBuf {
    root.join(format!(".{sha}.download"))
}

/// Opens `archive_path` as a ZIP stream and extracts into `target_root`,
/// rejecting any entry whose cleaned path would escape the root.
fn extract_zip(archive_path: &Path, target_root: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path).map_err(|e| Error::transient_io("opening archive", e))?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(target_root).map_err(|e| Error::transient_io("creating extraction root", e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.mangled_name();
        let dest = target_root.join(&name);
        let cleaned = clean_path(&dest);
        if !cleaned.starts_with(target_root) {
            return Err(Error::Validation(format!(
                "zip entry escapes extraction root: {}",
                name.display()
            )));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&cleaned).map_err(|e| Error::transient_io("creating zip dir", e))?;
        } else {
            if let Some(parent) = cleaned.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating zip parent dir", e))?;
            }
            let mut out = std::fs::File::create(&cleaned).map_err(|e| Error::transient_io("creating zip output file", e))?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| Error::transient_io("reading zip entry", e))?;
            std::io::Write::write_all(&mut out, &buf).map_err(|e| Error::transient_io("writing zip output", e))?;
        }
    }
    Ok(())
}

fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// If `root` contains exactly one top-level directory (as major providers'
/// archives do), returns its full path instead of the staging root.
fn find_single_top_level_dir(root: &Path) -> Result<Option<PathBuf>> {
    let mut entries = std::fs::read_dir(root).map_err(|e| Error::transient_io("reading extracted archive root", e))?;
    let first = entries.next();
    let second = entries.next();
    match (first, second) {
        (Some(Ok(entry)), None) if entry.path().is_dir() => Ok(Some(entry.path())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sha_from_archive_path() {
        let sha = extract_merge_commit_sha("https://api.example.com/repos/org/repo/archive/abc123def.zip").unwrap();
        assert_eq!(sha.0, "abc123def");
    }

    #[test]
    fn extracts_sha_from_query_param() {
        let sha = extract_merge_commit_sha("https://example.com/download?sha=deadbeef&token=x").unwrap();
        assert_eq!(sha.0, "deadbeef");
    }

    #[test]
    fn errors_when_no_sha_present() {
        assert!(extract_merge_commit_sha("https://example.com/download").is_err());
    }

    #[test]
    fn clean_path_collapses_parent_dir_escapes() {
        let root = PathBuf::from("/cache/sha1");
        let joined = root.join("../../etc/passwd");
        let cleaned = clean_path(&joined);
        assert!(!cleaned.starts_with(&root));
    }
}
