//! Runtime configuration (kubechecks.toml + environment overrides).
//!
//! Mirrors the config surface spec.md §6 lists as "CLI/env-driven"; here it
//! is a typed struct loaded from a layered TOML file with environment
//! variables taking precedence, in the style of a `.shipper.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlatformConfig {
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub send_full_repo: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    #[serde(rename = "type", default = "default_vcs_type")]
    pub provider_type: String,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_vcs_type() -> String {
    "github".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_repo_cache_dir")]
    pub dir: String,
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub shallow: bool,
}

fn default_repo_cache_dir() -> String {
    "/var/lib/kubechecks/repos".to_string()
}

impl Default for RepoCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_repo_cache_dir(),
            ttl: default_cache_ttl(),
            shallow: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveCacheConfig {
    #[serde(default = "default_archive_cache_dir")]
    pub dir: String,
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

fn default_archive_cache_dir() -> String {
    "/var/lib/kubechecks/archives".to_string()
}

impl Default for ArchiveCacheConfig {
    fn default() -> Self {
        Self {
            dir: default_archive_cache_dir(),
            ttl: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

/// Per-check enable flag plus an optional ceiling on the state that check's
/// results may contribute to the aggregate (`checks.worst-<name>-state`,
/// spec.md §6 — behavior resolved in DESIGN.md's Open Question entries).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub worst_state: Option<crate::types::State>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    #[serde(default)]
    pub by_name: std::collections::HashMap<String, CheckConfig>,
    #[serde(default)]
    pub policies_location: Vec<String>,
    #[serde(default)]
    pub schemas_location: Vec<String>,
    #[serde(default)]
    pub kyverno_policies_location: Vec<String>,
    #[serde(default)]
    pub openai_api_token: Option<String>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            by_name: Default::default(),
            policies_location: Vec::new(),
            schemas_location: Vec::new(),
            kyverno_policies_location: Vec::new(),
            openai_api_token: None,
        }
    }
}

impl ChecksConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.by_name.get(name).map(|c| c.enabled).unwrap_or(true)
    }

    pub fn worst_state(&self, name: &str) -> Option<crate::types::State> {
        self.by_name.get(name).and_then(|c| c.worst_state)
    }
}

/// Scheduler's configurable mid-flight replan policy (resolved Open
/// Question, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReplanPolicy {
    #[default]
    CancelQueued,
    Drain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default)]
    pub replan_policy: ReplanPolicy,
    #[serde(default)]
    pub label_filter: Vec<String>,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_concurrent_checks() -> usize {
    32
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrent_checks: default_max_concurrent_checks(),
            replan_policy: ReplanPolicy::default(),
            label_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    #[serde(default = "default_max_comment_length")]
    pub max_comment_length: usize,
    #[serde(default)]
    pub tidy_outdated_comments_mode: bool,
    #[serde(default = "default_replan_message")]
    pub replan_comment_message: String,
    #[serde(default = "default_identifier")]
    pub identifier: String,
}

fn default_max_comment_length() -> usize {
    65536
}

fn default_replan_message() -> String {
    "recheck".to_string()
}

fn default_identifier() -> String {
    "kubechecks".to_string()
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_comment_length: default_max_comment_length(),
            tidy_outdated_comments_mode: false,
            replan_comment_message: default_replan_message(),
            identifier: default_identifier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    pub deployment_platform: Option<DeploymentPlatformConfig>,
    pub vcs: Option<VcsConfig>,
    #[serde(default)]
    pub repo_cache: RepoCacheConfig,
    #[serde(default)]
    pub archive_mode: bool,
    #[serde(default)]
    pub archive_cache: ArchiveCacheConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub message: MessageConfig,
    #[serde(default = "default_fallback_k8s_version")]
    pub fallback_k8s_version: String,
}

fn default_fallback_k8s_version() -> String {
    "1.24".to_string()
}

impl RuntimeConfig {
    /// Load from a TOML file, then apply a handful of `KUBECHECKS_*`
    /// environment overrides for secrets that should never live in a
    /// checked-in config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: RuntimeConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("KUBECHECKS_VCS_TOKEN") {
            if let Some(vcs) = self.vcs.as_mut() {
                vcs.token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("KUBECHECKS_DEPLOYMENT_PLATFORM_TOKEN") {
            if let Some(dp) = self.deployment_platform.as_mut() {
                dp.token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("KUBECHECKS_OPENAI_API_TOKEN") {
            self.checks.openai_api_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_queue_size == 0 {
            return Err(Error::Config("scheduler.max_queue_size must be > 0".into()));
        }
        if self.scheduler.max_concurrent_checks == 0 {
            return Err(Error::Config(
                "scheduler.max_concurrent_checks must be > 0".into(),
            ));
        }
        if let Some(vcs) = &self.vcs {
            if vcs.base_url.is_empty() {
                return Err(Error::Config("vcs.base_url must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler.max_concurrent_checks, 32);
        assert_eq!(cfg.scheduler.replan_policy, ReplanPolicy::CancelQueued);
    }

    #[test]
    fn rejects_zero_queue_size() {
        let mut cfg = RuntimeConfig::default();
        cfg.scheduler.max_queue_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
archive_mode = true

[vcs]
base_url = "https://github.example.com"
type = "github"
"#;
        let cfg: RuntimeConfig = toml::from_str(toml).unwrap();
        assert!(cfg.archive_mode);
        assert_eq!(cfg.vcs.unwrap().base_url, "https://github.example.com");
    }

    #[test]
    fn checks_config_default_enabled() {
        let checks = ChecksConfig::default();
        assert!(checks.is_enabled("kubeconform"));
        assert!(checks.worst_state("kubeconform").is_none());
    }
}
