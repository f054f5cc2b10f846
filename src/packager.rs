//! AppPackager (spec §4.6): assembles an isolated temp tree containing
//! exactly the files the manifest renderer needs for one application.

use std::path::{Path, PathBuf};

use tracing::instrument;
use walkdir::WalkDir;

use crate::appindex::kustomize::{self, RealFileSystem};
use crate::error::{Error, Result};
use crate::types::{Application, PullRequest, Source};

pub struct PackagedTree {
    pub root: PathBuf,
    /// Rewritten `helm.valueFiles` entries, if any were ref-sourced.
    pub rewritten_value_files: Vec<(String, String)>,
}

impl PackagedTree {
    /// Tars and gzips the packaged tree so it can be streamed to the
    /// renderer in ≤1024-byte chunks (§4.7 step 4) with its checksum taken
    /// over the compressed bytes (§4.7 step 3).
    pub fn compress(&self) -> Result<Vec<u8>> {
        let mut gz = Vec::new();
        {
            let encoder = flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(".", &self.root)
                .map_err(|e| Error::transient_io("tarring packaged tree", e))?;
            builder
                .into_inner()
                .map_err(|e| Error::transient_io("finishing tar stream", e))?
                .finish()
                .map_err(|e| Error::transient_io("finishing gzip stream", e))?;
        }
        Ok(gz)
    }
}

pub struct AppPackager;

impl AppPackager {
    /// A ref source matching the PR's clone URL and base ref is rewritten
    /// to the head ref — the "post-merge view" transformation (§4.6 step
    /// 1). Applications with no `sources[]` use the implicit source
    /// untransformed.
    pub fn transform_ref_sources(app: &Application, pr: &PullRequest) -> Vec<Source> {
        app.sources
            .iter()
            .map(|s| {
                let mut s = s.clone();
                if s.is_ref() && s.repo_url == pr.clone_url && s.target_revision == pr.base_ref {
                    s.target_revision = pr.head_ref.clone();
                }
                s
            })
            .collect()
    }

    /// Packages `app` into a fresh temp directory under `base_repo_dir`'s
    /// materialized content, resolving ref sources via `resolve_ref_repo`
    /// (a callback into `SnapshotCache::acquire` for a possibly different
    /// clone URL).
    #[instrument(skip(self, resolve_ref_repo))]
    pub async fn package<F, Fut>(
        &self,
        app: &Application,
        pr: &PullRequest,
        base_repo_dir: &Path,
        resolve_ref_repo: F,
    ) -> Result<PackagedTree>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<PathBuf>>,
    {
        let sources = if app.sources.is_empty() {
            Vec::new()
        } else {
            Self::transform_ref_sources(app, pr)
        };

        let (content, refs): (Option<Source>, Vec<Source>) = if sources.is_empty() {
            (app.implicit_source().cloned(), Vec::new())
        } else {
            let mut content = None;
            let mut refs = Vec::new();
            for s in sources {
                if s.is_ref() {
                    refs.push(s);
                } else if content.is_none() {
                    content = Some(s);
                } else {
                    refs.push(s);
                }
            }
            (content, refs)
        };

        let content = content.ok_or_else(|| Error::Internal(format!("app {} has no content source", app.name)))?;

        let tmp_dir = tempfile::Builder::new()
            .prefix("package-")
            .tempdir()
            .map_err(|e| Error::transient_io("creating package temp dir", e))?;
        let tmp_root = tmp_dir.into_path();

        let source_src = base_repo_dir.join(&content.path);
        let source_dst = tmp_root.join(&content.path);
        copy_tree(&source_src, &source_dst)?;

        let kustomization_path = source_dst.join("kustomization.yaml");
        if kustomization_path.exists() {
            let discovered = kustomize::walk(&RealFileSystem, base_repo_dir, &content.path);
            for rel in discovered {
                let dst = tmp_root.join(&rel);
                if dst.exists() {
                    continue;
                }
                let src = base_repo_dir.join(&rel);
                if src.exists() {
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating kustomize copy dir", e))?;
                    }
                    std::fs::copy(&src, &dst).map_err(|e| Error::transient_io("copying kustomize dependency", e))?;
                }
            }
        }

        let chart_path = source_dst.join("Chart.yaml");
        if content.helm.is_some() && chart_path.exists() {
            self.copy_helm_file_deps(&chart_path, base_repo_dir, &content.path, &tmp_root)?;
        }

        let mut rewritten = Vec::new();
        if let Some(helm) = &content.helm {
            for value_file in &helm.value_files {
                if let Some(rest) = value_file.strip_prefix('$') {
                    let (ref_name, ref_path) = rest
                        .split_once('/')
                        .ok_or_else(|| Error::Validation(format!("malformed ref value file: {value_file}")))?;
                    let ref_source = refs
                        .iter()
                        .find(|r| r.ref_name.as_deref() == Some(ref_name))
                        .ok_or_else(|| Error::NotFound(format!("ref source {ref_name} not found")))?;

                    let ref_repo_dir = resolve_ref_repo(ref_source.repo_url.clone()).await?;
                    let ref_src = ref_repo_dir.join(ref_path);
                    let dst = tmp_root.join(".refs").join(ref_name).join(ref_path);
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating ref value dir", e))?;
                    }
                    if !ref_src.exists() {
                        if helm.ignore_missing_value_files {
                            continue;
                        }
                        return Err(Error::NotFound(format!("ref value file missing: {}", ref_src.display())));
                    }
                    std::fs::copy(&ref_src, &dst).map_err(|e| Error::transient_io("copying ref value file", e))?;

                    let rewritten_path = pathdiff_str(&content.path, &format!(".refs/{ref_name}/{ref_path}"));
                    rewritten.push((value_file.clone(), rewritten_path));
                    continue;
                }

                if value_file.contains("://") {
                    continue;
                }

                let rel = relpath(&content.path, value_file);
                if !rel.starts_with("../") {
                    continue; // already copied in step 2
                }

                let src = base_repo_dir.join(&content.path).join(value_file);
                let dst = source_dst.join(value_file);
                if !src.exists() {
                    if helm.ignore_missing_value_files {
                        continue;
                    }
                    return Err(Error::NotFound(format!("value file missing: {}", src.display())));
                }
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating value file dir", e))?;
                }
                std::fs::copy(&src, &dst).map_err(|e| Error::transient_io("copying value file", e))?;
            }
        }

        Ok(PackagedTree {
            root: tmp_root,
            rewritten_value_files: rewritten,
        })
    }

    fn copy_helm_file_deps(&self, chart_path: &Path, base_repo_dir: &Path, source_path: &str, tmp_root: &Path) -> Result<()> {
        #[derive(serde::Deserialize)]
        struct ChartYaml {
            #[serde(default)]
            dependencies: Vec<ChartDependency>,
        }
        #[derive(serde::Deserialize)]
        struct ChartDependency {
            repository: Option<String>,
        }

        let content = std::fs::read_to_string(chart_path).map_err(|e| Error::transient_io("reading Chart.yaml", e))?;
        let chart: ChartYaml = serde_yaml::from_str(&content)?;

        for dep in chart.dependencies {
            if let Some(repo) = dep.repository {
                if let Some(relpath) = repo.strip_prefix("file://") {
                    let joined = kustomize_clean(source_path, relpath);
                    let src = base_repo_dir.join(&joined);
                    let dst = tmp_root.join(&joined);
                    copy_tree(&src, &dst)?;
                }
            }
        }
        Ok(())
    }
}

fn kustomize_clean(source_path: &str, entry: &str) -> String {
    crate::appindex::clean_join(source_path, entry)
}

fn relpath(from: &str, to: &str) -> String {
    // `to` is already relative to `from`'s directory by convention in
    // spec.md examples (value files are given relative to source.path);
    // this computes the "would need ../ to escape" check via clean_join.
    let cleaned = kustomize_clean(from, to);
    if cleaned.starts_with(from.trim_start_matches('/')) {
        to.to_string()
    } else {
        format!("../{cleaned}")
    }
}

fn pathdiff_str(from_dir: &str, target: &str) -> String {
    let depth = from_dir.trim_matches('/').split('/').filter(|s| !s.is_empty()).count();
    let prefix = "../".repeat(depth.max(1));
    format!("{prefix}{target}")
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(Error::NotFound(format!("source path missing: {}", src.display())));
    }
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating copy dir", e))?;
        }
        std::fs::copy(src, dst).map_err(|e| Error::transient_io("copying file", e))?;
        return Ok(());
    }

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Internal(format!("walking source tree: {e}")))?;
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| Error::transient_io("creating dest dir", e))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::transient_io("creating dest parent dir", e))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| Error::transient_io("copying tree entry", e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HelmSource;

    fn pr() -> PullRequest {
        PullRequest {
            provider: "github".into(),
            full_name: "org/repo".into(),
            check_id: "1".into(),
            head_sha: "abc123".into(),
            base_ref: "main".into(),
            head_ref: "feature".into(),
            clone_url: "https://example.com/org/repo".into(),
            labels: vec![],
        }
    }

    #[test]
    fn transform_ref_sources_rewrites_matching_base_ref() {
        let app = Application {
            name: "a".into(),
            project: "default".into(),
            destination: "in-cluster".into(),
            sources: vec![
                Source {
                    repo_url: "https://example.com/org/repo".into(),
                    target_revision: "main".into(),
                    path: "app1".into(),
                    helm: Some(HelmSource::default()),
                    kustomize: None,
                    ref_name: None,
                },
                Source {
                    repo_url: "https://example.com/org/repo".into(),
                    target_revision: "main".into(),
                    path: "refs/staging".into(),
                    helm: None,
                    kustomize: None,
                    ref_name: Some("staging".into()),
                },
            ],
        };

        let rewritten = AppPackager::transform_ref_sources(&app, &pr());
        assert_eq!(rewritten[0].target_revision, "main");
        assert_eq!(rewritten[1].target_revision, "feature");
    }

    #[test]
    fn unused_value_file_packaging() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        std::fs::create_dir_all(base.join("app1")).unwrap();
        std::fs::write(base.join("app1/Chart.yaml"), "name: app1\n").unwrap();
        std::fs::write(base.join("app1/values.yaml"), "key: value\n").unwrap();

        let app = Application {
            name: "app1".into(),
            project: "default".into(),
            destination: "in-cluster".into(),
            sources: vec![],
        };
        let mut app_with_source = app;
        app_with_source.sources = vec![Source {
            repo_url: "https://example.com/org/repo".into(),
            target_revision: "main".into(),
            path: "app1".into(),
            helm: Some(HelmSource {
                value_files: vec!["./values.yaml".into(), "missing.yaml".into()],
                ignore_missing_value_files: true,
            }),
            kustomize: None,
            ref_name: None,
        }];

        let packager = AppPackager;
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(packager.package(&app_with_source, &pr(), base, |_| async {
            unreachable!("no ref sources in this fixture")
        }));
        let tree = result.unwrap();
        assert!(tree.root.join("app1/Chart.yaml").exists());
        assert!(tree.root.join("app1/values.yaml").exists());
        assert!(!tree.root.join("app1/missing.yaml").exists());
    }

    #[test]
    fn ref_value_file_packaging() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        std::fs::create_dir_all(base.join("app1")).unwrap();
        std::fs::write(base.join("app1/Chart.yaml"), "name: app1\n").unwrap();
        std::fs::write(base.join("app1/values.yaml"), "key: value\n").unwrap();

        let ref_tmp = tempfile::tempdir().unwrap();
        let ref_base = ref_tmp.path();
        std::fs::write(ref_base.join("base.yaml"), "staging: true\n").unwrap();

        let app = Application {
            name: "app1".into(),
            project: "default".into(),
            destination: "in-cluster".into(),
            sources: vec![
                Source {
                    repo_url: "https://example.com/org/repo".into(),
                    target_revision: "main".into(),
                    path: "app1".into(),
                    helm: Some(HelmSource {
                        value_files: vec!["./values.yaml".into(), "$staging/base.yaml".into()],
                        ignore_missing_value_files: false,
                    }),
                    kustomize: None,
                    ref_name: None,
                },
                Source {
                    repo_url: "https://example.com/org/other-repo".into(),
                    target_revision: "main".into(),
                    path: "base".into(),
                    helm: None,
                    kustomize: None,
                    ref_name: Some("staging".into()),
                },
            ],
        };

        let packager = AppPackager;
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ref_base_path = ref_base.to_path_buf();
        let result = rt.block_on(packager.package(&app, &pr(), base, move |_repo_url| {
            let ref_base_path = ref_base_path.clone();
            async move { Ok(ref_base_path) }
        }));

        let tree = result.unwrap();
        assert!(tree.root.join("app1/Chart.yaml").exists());
        assert!(tree.root.join("app1/values.yaml").exists());
        assert!(tree.root.join(".refs/staging/base.yaml").exists());
        assert_eq!(tree.rewritten_value_files.len(), 1);
        assert_eq!(tree.rewritten_value_files[0].1, "../.refs/staging/base.yaml");
    }

    #[test]
    fn kustomize_transitive_deps_are_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();

        std::fs::create_dir_all(base.join("app1")).unwrap();
        std::fs::write(
            base.join("app1/kustomization.yaml"),
            "resources:\n  - ../base\n  - resource1.yaml\ncomponents:\n  - ../component1\ncrds:\n  - crds/crd1.yaml\n",
        )
        .unwrap();
        std::fs::write(base.join("app1/resource1.yaml"), "").unwrap();
        std::fs::create_dir_all(base.join("app1/crds")).unwrap();
        std::fs::write(base.join("app1/crds/crd1.yaml"), "").unwrap();

        std::fs::create_dir_all(base.join("base")).unwrap();
        std::fs::write(
            base.join("base/kustomization.yaml"),
            "resources:\n  - resource2.yaml\n  - ../component1\n",
        )
        .unwrap();
        std::fs::write(base.join("base/resource2.yaml"), "").unwrap();

        std::fs::create_dir_all(base.join("component1")).unwrap();
        std::fs::write(base.join("component1/kustomization.yaml"), "resources:\n  - patch.yaml\n").unwrap();
        std::fs::write(base.join("component1/patch.yaml"), "").unwrap();

        let app = Application {
            name: "app1".into(),
            project: "default".into(),
            destination: "in-cluster".into(),
            sources: vec![Source {
                repo_url: "https://example.com/org/repo".into(),
                target_revision: "main".into(),
                path: "app1".into(),
                helm: None,
                kustomize: Some(crate::types::KustomizeSource { enabled: true }),
                ref_name: None,
            }],
        };

        let packager = AppPackager;
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(packager.package(&app, &pr(), base, |_| async {
            unreachable!("no ref sources in this fixture")
        }));

        let tree = result.unwrap();
        let mut copied = Vec::new();
        for entry in walkdir::WalkDir::new(&tree.root) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                copied.push(entry.path().strip_prefix(&tree.root).unwrap().to_string_lossy().replace('\\', "/"));
            }
        }
        copied.sort();

        // app1/crds/crd1.yaml is in the tree only because it was already
        // inside the copied content source — the `crds:` key isn't a
        // recognized kustomize field and is never discovered. Every
        // dependency directory's own kustomization.yaml is discovered and
        // copied so `kustomize build` has something to read there.
        assert_eq!(
            copied,
            vec![
                "app1/crds/crd1.yaml",
                "app1/kustomization.yaml",
                "app1/resource1.yaml",
                "base/kustomization.yaml",
                "base/resource2.yaml",
                "component1/kustomization.yaml",
                "component1/patch.yaml",
            ]
        );
    }
}
