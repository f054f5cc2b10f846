//! `DeploymentPlatform`: the narrow deployment-platform capability set
//! this core consumes (spec.md §6) — application listing, live managed
//! resources for the diff check, cluster facts for the renderer request,
//! and project-scoped settings. The concrete API client is a
//! collaborator, out of scope; this module fixes the contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Application;

/// Kubernetes version and supported API versions for a target cluster,
/// fed into `renderer::RenderRequest`.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub kubernetes_version: String,
    pub api_versions: Vec<String>,
}

/// Project-scoped settings: permitted Helm repositories/credentials and
/// the platform's resource-tracking configuration.
#[derive(Debug, Clone, Default)]
pub struct PlatformSettings {
    pub helm_repositories: Vec<String>,
    pub tracking_method: String,
}

/// One live, cluster-managed resource belonging to an application, as
/// reported by `ListManagedResources`.
#[derive(Debug, Clone)]
pub struct ManagedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    async fn list_applications(&self) -> Result<Vec<Application>>;
    async fn get_application(&self, name: &str) -> Result<Application>;
    async fn list_managed_resources(&self, app_name: &str) -> Result<Vec<ManagedResource>>;
    async fn get_cluster(&self, query: &str) -> Result<ClusterInfo>;
    async fn get_settings(&self) -> Result<PlatformSettings>;
}
