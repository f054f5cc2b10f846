//! AppIndex: an in-memory, repo-keyed reverse index mapping
//! every tracked application to the files/directories whose change would
//! affect it. Mutated by informer add/update/delete events, queried by
//! `FindAffected`.

pub mod kustomize;

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::instrument;

use crate::types::{Application, ApplicationStub, RepoAppIndex, Source};

/// Cleans `./`/`../` components and joins with forward slashes, matching
/// the normalization used for `dirToApps`/`fileToApps` keys.
pub fn clean_join(source_path: &str, entry: &str) -> String {
    let joined = format!("{}/{}", source_path.trim_end_matches('/'), entry);
    clean_path(&joined)
}

/// Strips a leading `/` and resolves `.`/`..` components, matching the
/// normalization `clean_join` applies when building `dirToApps`/
/// `fileToApps` keys — changed-file paths reported by a VCS provider
/// (which may be `/`-rooted) must go through the same cleaning before
/// they are looked up against those keys.
fn clean_path(path: &str) -> String {
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

fn stub_for(app: &Application, source: &Source) -> ApplicationStub {
    ApplicationStub {
        name: app.name.clone(),
        path: source.path.clone(),
        is_helm: source.helm.is_some(),
        is_kustomize: source.kustomize.as_ref().map(|k| k.enabled).unwrap_or(false),
        target_revision: source.target_revision.clone(),
    }
}

/// Per-process registry of `RepoAppIndex`es keyed by normalized repo URL.
/// Write lock held only during informer mutations; read lock held only
/// during `find_affected`.
#[derive(Default)]
pub struct AppIndex {
    repos: RwLock<HashMap<String, RepoAppIndex>>,
}

impl AppIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an application's entry, keyed by (repoURL, name).
    /// Computes the stub from the application's content source and indexes
    /// its path plus any `helm.valueFiles`/`helm.fileParameters.path`
    /// entries (joined with the source path and cleaned).
    #[instrument(skip(self, app))]
    pub async fn upsert(&self, repo_url: &str, app: &Application) {
        let (content, _refs) = app.split_sources();
        let source = match content.or_else(|| app.implicit_source()) {
            Some(s) => s,
            None => return,
        };
        let stub = stub_for(app, source);

        let mut repos = self.repos.write().await;
        let index = repos.entry(repo_url.to_string()).or_default();

        Self::remove_from_indexes(index, &app.name);

        index
            .dir_to_apps
            .entry(source.path.clone())
            .or_default()
            .insert(app.name.clone());

        if let Some(helm) = &source.helm {
            for value_file in &helm.value_files {
                if value_file.starts_with('$') || value_file.contains("://") {
                    continue;
                }
                let cleaned = clean_join(&source.path, value_file);
                index
                    .file_to_apps
                    .entry(cleaned)
                    .or_default()
                    .insert(app.name.clone());
            }
        }

        index.apps_by_name.insert(app.name.clone(), stub);
    }

    /// Scrubs all three indexes of `name`.
    #[instrument(skip(self))]
    pub async fn remove(&self, repo_url: &str, name: &str) {
        let mut repos = self.repos.write().await;
        if let Some(index) = repos.get_mut(repo_url) {
            Self::remove_from_indexes(index, name);
            index.apps_by_name.remove(name);
        }
    }

    fn remove_from_indexes(index: &mut RepoAppIndex, name: &str) {
        for apps in index.dir_to_apps.values_mut() {
            apps.remove(name);
        }
        index.dir_to_apps.retain(|_, apps| !apps.is_empty());
        for apps in index.file_to_apps.values_mut() {
            apps.remove(name);
        }
        index.file_to_apps.retain(|_, apps| !apps.is_empty());
    }

    /// Unions `discovered` (from `kustomize::walk`) into the primary index
    /// under `app_name`'s ownership.
    #[instrument(skip(self, discovered))]
    pub async fn union_discovered_paths(&self, repo_url: &str, app_name: &str, discovered: &[String]) {
        let mut repos = self.repos.write().await;
        let index = repos.entry(repo_url.to_string()).or_default();
        for path in discovered {
            index
                .file_to_apps
                .entry(path.clone())
                .or_default()
                .insert(app_name.to_string());
        }
    }

    /// For each changed file, matches via directory
    /// prefix or exact file-path membership; deduplicated by app name.
    #[instrument(skip(self, changed_files))]
    pub async fn find_affected(&self, repo_url: &str, changed_files: &[String]) -> Vec<ApplicationStub> {
        let repos = self.repos.read().await;
        let index = match repos.get(repo_url) {
            Some(i) => i,
            None => return Vec::new(),
        };

        let mut matched: HashSet<String> = HashSet::new();
        for file in changed_files {
            let file = clean_path(file);
            for (dir, apps) in &index.dir_to_apps {
                if is_strict_prefix(dir, &file) {
                    matched.extend(apps.iter().cloned());
                }
            }
            if let Some(apps) = index.file_to_apps.get(&file) {
                matched.extend(apps.iter().cloned());
            }
        }

        matched
            .into_iter()
            .filter_map(|name| index.apps_by_name.get(&name).cloned())
            .collect()
    }

    pub async fn get(&self, repo_url: &str, name: &str) -> Option<ApplicationStub> {
        let repos = self.repos.read().await;
        repos.get(repo_url).and_then(|i| i.apps_by_name.get(name)).cloned()
    }
}

fn is_strict_prefix(dir: &str, file: &str) -> bool {
    let dir = dir.trim_start_matches('/').trim_end_matches('/');
    let file = file.trim_start_matches('/');
    if dir.is_empty() {
        return false;
    }
    file.starts_with(dir) && (file.len() == dir.len() || file.as_bytes()[dir.len()] == b'/')
}
