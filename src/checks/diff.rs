//! DiffCheck: compares rendered manifests against live cluster objects
//! for one application, and is the sole source of the child-app feedback
//! loop — newly rendered `Application` resources get queued into the
//! same run; ones that disappeared are hidden from the final message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::platform::{DeploymentPlatform, ManagedResource};
use crate::scheduler::ChildAppFeedback;
use crate::types::{ApplicationStub, CheckResult, State};

use super::Check;

/// Seam between `DiffCheck` and whatever already rendered this app's
/// manifests (the packaging + `renderer::ManifestRenderer` round trip
/// the provider-specific driver drives before fanning checks out).
#[async_trait]
pub trait RenderedManifests: Send + Sync {
    async fn manifests_for(&self, app_name: &str) -> Result<Vec<String>>;
}

/// The `RenderedManifests` implementation `CheckScheduler` actually
/// populates: one `ManifestRenderer::render` call's output per app, keyed
/// by name for the lifetime of a single PR check run, then cleared before
/// the next one so a stale render can never leak into a later check.
#[derive(Default)]
pub struct RenderedManifestStore {
    by_app: RwLock<HashMap<String, Vec<String>>>,
}

impl RenderedManifestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, app_name: &str, manifests: Vec<String>) {
        self.by_app.write().await.insert(app_name.to_string(), manifests);
    }

    pub async fn clear(&self) {
        self.by_app.write().await.clear();
    }
}

#[async_trait]
impl RenderedManifests for RenderedManifestStore {
    async fn manifests_for(&self, app_name: &str) -> Result<Vec<String>> {
        self.by_app
            .read()
            .await
            .get(app_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no rendered manifests for app {app_name}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestDoc {
    #[serde(rename = "apiVersion", default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ManifestMetadata,
    #[serde(default)]
    spec: Option<ArgoCdSpec>,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Deserialize, Default)]
struct ArgoCdSpec {
    source: Option<ArgoCdSource>,
}

#[derive(Debug, Deserialize, Default)]
struct ArgoCdSource {
    #[serde(rename = "repoURL", default)]
    #[allow(dead_code)]
    repo_url: String,
    #[serde(default)]
    path: String,
    #[serde(rename = "targetRevision", default)]
    target_revision: String,
}

fn key_for(doc: &ManifestDoc) -> ResourceKey {
    ResourceKey {
        api_version: doc.api_version.clone(),
        kind: doc.kind.clone(),
        namespace: doc.metadata.namespace.clone(),
        name: doc.metadata.name.clone(),
    }
}

fn key_for_live(r: &ManagedResource) -> ResourceKey {
    ResourceKey {
        api_version: r.api_version.clone(),
        kind: r.kind.clone(),
        namespace: r.namespace.clone(),
        name: r.name.clone(),
    }
}

pub struct DiffCheck {
    manifests: Arc<dyn RenderedManifests>,
    platform: Arc<dyn DeploymentPlatform>,
}

impl DiffCheck {
    pub fn new(manifests: Arc<dyn RenderedManifests>, platform: Arc<dyn DeploymentPlatform>) -> Self {
        Self { manifests, platform }
    }

    fn child_stub(doc: &ManifestDoc) -> Option<ApplicationStub> {
        let source = doc.spec.as_ref()?.source.as_ref()?;
        Some(ApplicationStub {
            name: doc.metadata.name.clone(),
            path: source.path.clone(),
            is_helm: false,
            is_kustomize: false,
            target_revision: source.target_revision.clone(),
        })
    }
}

#[async_trait]
impl Check for DiffCheck {
    fn name(&self) -> &str {
        "diff"
    }

    #[instrument(skip(self, feedback), fields(app = %app.name))]
    async fn run(&self, app: &ApplicationStub, feedback: &ChildAppFeedback) -> CheckResult {
        let rendered = match self.manifests.manifests_for(&app.name).await {
            Ok(docs) => docs,
            Err(e) => {
                return CheckResult {
                    check_name: self.name().to_string(),
                    state: State::Error,
                    summary: "failed to load rendered manifests".into(),
                    details: e.to_string(),
                    no_changes_detected: false,
                }
            }
        };

        let live = match self.platform.list_managed_resources(&app.name).await {
            Ok(r) => r,
            Err(e) => {
                return CheckResult {
                    check_name: self.name().to_string(),
                    state: State::Error,
                    summary: "failed to load live cluster resources".into(),
                    details: e.to_string(),
                    no_changes_detected: false,
                }
            }
        };

        let rendered_docs: Vec<ManifestDoc> = rendered
            .iter()
            .filter_map(|y| serde_yaml::from_str(y).ok())
            .collect();

        let rendered_keys: HashSet<ResourceKey> = rendered_docs.iter().map(key_for).collect();
        let live_keys: HashSet<ResourceKey> = live.iter().map(key_for_live).collect();

        let added: Vec<&ManifestDoc> = rendered_docs
            .iter()
            .filter(|d| !live_keys.contains(&key_for(d)))
            .collect();
        let removed: Vec<&ResourceKey> = live_keys.difference(&rendered_keys).collect();

        for doc in &added {
            if doc.kind == "Application" {
                if let Some(stub) = Self::child_stub(doc) {
                    feedback.queue_app(stub);
                }
            }
        }
        for key in &removed {
            if key.kind == "Application" {
                feedback.remove_app(key.name.clone());
            }
        }

        let no_changes_detected = added.is_empty() && removed.is_empty();
        let mut details = String::new();
        for doc in &added {
            details.push_str(&format!("+ {} {}/{}\n", doc.kind, doc.metadata.namespace, doc.metadata.name));
        }
        for key in &removed {
            details.push_str(&format!("- {} {}/{}\n", key.kind, key.namespace, key.name));
        }

        CheckResult {
            check_name: self.name().to_string(),
            state: if no_changes_detected { State::Success } else { State::Warning },
            summary: format!("{} resource(s) added, {} removed", added.len(), removed.len()),
            details,
            no_changes_detected,
        }
    }
}
