//! KustomizeWalker: recursive `kustomization.yaml` dependency
//! discovery, cycle-safe via a visited-set keyed by cleaned absolute path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Filesystem abstraction so tests can walk an in-memory tree instead of
/// real disk (teacher's `serde_yaml` dependency already covers parsing).
pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
}

pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[derive(Debug, Deserialize, Default)]
struct Kustomization {
    #[serde(default)]
    resources: Vec<String>,
    #[serde(default)]
    bases: Vec<String>,
    #[serde(default, rename = "patchesStrategicMerge")]
    patches_strategic_merge: Vec<String>,
    #[serde(default, rename = "patchesJson6902")]
    patches_json6902: Vec<PatchJson6902>,
    #[serde(default)]
    components: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PatchJson6902 {
    path: String,
}

/// Recursively resolves `kustomization.yaml` dependencies starting at
/// `start_dir` (repo-root relative), returning every discovered file path
/// in repo-relative, forward-slash form.
pub fn walk(fs: &dyn FileSystem, repo_root: &Path, start_dir: &str) -> Vec<String> {
    let mut discovered = Vec::new();
    let mut visited = HashSet::new();
    walk_inner(fs, repo_root, start_dir, &mut discovered, &mut visited);
    discovered
}

fn walk_inner(
    fs: &dyn FileSystem,
    repo_root: &Path,
    dir: &str,
    discovered: &mut Vec<String>,
    visited: &mut HashSet<PathBuf>,
) {
    let cleaned_abs = clean_join(repo_root, dir);
    if !visited.insert(cleaned_abs.clone()) {
        return; // cycle
    }

    let kustomization_path = cleaned_abs.join("kustomization.yaml");
    let content = match fs.read_to_string(&kustomization_path) {
        Ok(c) => c,
        Err(_) => {
            warn!(path = %kustomization_path.display(), "missing kustomization.yaml");
            return;
        }
    };

    let parsed: Kustomization = match serde_yaml::from_str(&content) {
        Ok(k) => k,
        Err(e) => {
            warn!(path = %kustomization_path.display(), error = %e, "failed parsing kustomization.yaml");
            return;
        }
    };

    // A directory contributing resources/bases/components needs its own
    // kustomization.yaml present in the packaged tree too, or `kustomize
    // build` has nothing to read there.
    discovered.push(clean_repo_relative(&format!("{dir}/kustomization.yaml")));

    for resource in parsed.resources {
        if resource.contains("://") {
            continue; // remote, ignored
        }
        resolve_entry(fs, repo_root, dir, &resource, discovered, visited);
    }
    for base in parsed.bases {
        resolve_directory(fs, repo_root, dir, &base, discovered, visited);
    }
    for component in parsed.components {
        resolve_directory(fs, repo_root, dir, &component, discovered, visited);
    }
    for patch in parsed.patches_strategic_merge {
        discovered.push(join_relative(dir, &patch));
    }
    for patch in parsed.patches_json6902 {
        discovered.push(join_relative(dir, &patch.path));
    }
}

fn resolve_entry(
    fs: &dyn FileSystem,
    repo_root: &Path,
    dir: &str,
    entry: &str,
    discovered: &mut Vec<String>,
    visited: &mut HashSet<PathBuf>,
) {
    let rel = join_relative(dir, entry);
    let abs = clean_join(repo_root, &rel);
    if fs.is_dir(&abs) {
        walk_inner(fs, repo_root, &rel, discovered, visited);
    } else if fs.is_file(&abs) {
        discovered.push(rel);
    } else {
        discovered.push(rel);
    }
}

fn resolve_directory(
    fs: &dyn FileSystem,
    repo_root: &Path,
    dir: &str,
    entry: &str,
    discovered: &mut Vec<String>,
    visited: &mut HashSet<PathBuf>,
) {
    let rel = join_relative(dir, entry);
    let _ = fs;
    walk_inner(fs, repo_root, &rel, discovered, visited);
}

/// Joins `entry` relative to `dir`: absolute paths (leading `/`) root at
/// the repo root; otherwise join with `dir`, then clean `.`/`..`.
fn join_relative(dir: &str, entry: &str) -> String {
    let joined = if let Some(stripped) = entry.strip_prefix('/') {
        stripped.to_string()
    } else {
        format!("{dir}/{entry}")
    };
    clean_repo_relative(&joined)
}

fn clean_repo_relative(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn clean_join(repo_root: &Path, rel: &str) -> PathBuf {
    let cleaned = clean_repo_relative(rel);
    repo_root.join(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct InMemoryFs {
        files: Mutex<HashMap<String, String>>,
        dirs: Mutex<std::collections::HashSet<String>>,
    }

    impl InMemoryFs {
        fn new() -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
                dirs: Mutex::new(std::collections::HashSet::new()),
            }
        }

        fn add_file(&self, path: &str, content: &str) {
            self.files.lock().unwrap().insert(path.to_string(), content.to_string());
        }

        fn add_dir(&self, path: &str) {
            self.dirs.lock().unwrap().insert(path.to_string());
        }
    }

    impl FileSystem for InMemoryFs {
        fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(&path.to_string_lossy().to_string())
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "not found"))
        }
        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.lock().unwrap().contains(&path.to_string_lossy().to_string())
        }
        fn is_file(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(&path.to_string_lossy().to_string())
        }
    }

    #[test]
    fn transitive_kustomize_deps_are_discovered() {
        let repo_root = Path::new("/repo");
        let fs = InMemoryFs::new();

        fs.add_dir("/repo/app1");
        fs.add_file(
            "/repo/app1/kustomization.yaml",
            "resources:\n  - ../base\n  - resource1.yaml\ncomponents:\n  - ../component1\n",
        );
        fs.add_dir("/repo/base");
        fs.add_file(
            "/repo/base/kustomization.yaml",
            "resources:\n  - resource2.yaml\n  - ../component1\n",
        );
        fs.add_dir("/repo/component1");
        fs.add_file("/repo/component1/kustomization.yaml", "resources:\n  - patch.yaml\n");
        fs.add_file("/repo/app1/resource1.yaml", "");
        fs.add_file("/repo/base/resource2.yaml", "");
        fs.add_file("/repo/component1/patch.yaml", "");

        let discovered = walk(&fs, repo_root, "app1");
        let mut sorted = discovered.clone();
        sorted.sort();
        // component1 is reachable both via base's resources and app1's own
        // components list; the visited-set means it is only walked once.
        // Each visited directory's own kustomization.yaml is recorded too,
        // so `kustomize build` has something to read once the tree is
        // packaged.
        assert_eq!(
            sorted,
            vec![
                "app1/kustomization.yaml",
                "app1/resource1.yaml",
                "base/kustomization.yaml",
                "base/resource2.yaml",
                "component1/kustomization.yaml",
                "component1/patch.yaml",
            ]
        );
    }

    #[test]
    fn cyclic_bases_do_not_infinite_loop() {
        let repo_root = Path::new("/repo");
        let fs = InMemoryFs::new();
        fs.add_dir("/repo/a");
        fs.add_dir("/repo/b");
        fs.add_file("/repo/a/kustomization.yaml", "bases:\n  - ../b\n");
        fs.add_file("/repo/b/kustomization.yaml", "bases:\n  - ../a\n");

        let discovered = walk(&fs, repo_root, "a");
        let mut sorted = discovered.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a/kustomization.yaml", "b/kustomization.yaml"]);
    }

    #[test]
    fn remote_resources_are_ignored() {
        let repo_root = Path::new("/repo");
        let fs = InMemoryFs::new();
        fs.add_dir("/repo/app1");
        fs.add_file(
            "/repo/app1/kustomization.yaml",
            "resources:\n  - https://example.com/k8s/base\n  - local.yaml\n",
        );
        fs.add_file("/repo/app1/local.yaml", "");

        let discovered = walk(&fs, repo_root, "app1");
        assert_eq!(
            discovered,
            vec!["app1/kustomization.yaml".to_string(), "app1/local.yaml".to_string()]
        );
    }
}
