//! Deployment, stage and live-state types exchanged with the host runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::config::{ApplicationConfig, ConfigError};

pub const DEFAULT_APP_CONFIG_FILENAME: &str = "app.pipecd.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failure,
    /// The stage was cancelled before it finished.
    Exited,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Success => "SUCCESS",
            StageStatus::Failure => "FAILURE",
            StageStatus::Exited => "EXITED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    QuickSync,
    Pipeline,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::QuickSync => f.write_str("QUICK_SYNC"),
            SyncStrategy::Pipeline => f.write_str("PIPELINE"),
        }
    }
}

/// One side (running or target) of a deployment: a checked-out application
/// directory at a commit, with its parsed config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSource {
    pub application_directory: PathBuf,
    pub commit_hash: String,
    pub application_config_filename: String,
    pub application_config: ApplicationConfig,
}

impl DeploymentSource {
    /// Read `<dir>/<config_filename>` and bind it to `commit_hash`.
    pub fn load(dir: impl AsRef<Path>, commit_hash: &str, config_filename: &str) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let filename = if config_filename.is_empty() { DEFAULT_APP_CONFIG_FILENAME } else { config_filename };
        let path = dir.join(filename);
        let data = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Ok(Self {
            application_directory: dir.to_path_buf(),
            commit_hash: commit_hash.to_string(),
            application_config_filename: filename.to_string(),
            application_config: ApplicationConfig::from_yaml(&data)?,
        })
    }

    pub fn is_empty(&self) -> bool { self.commit_hash.is_empty() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub application_name: String,
    pub piped_id: String,
}

/// A named cluster the plugin deploys into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployTarget {
    pub name: String,
    pub config: KubernetesDeployTargetConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesDeployTargetConfig {
    /// Empty means in-cluster (or the ambient kubeconfig).
    pub kubeconfig_path: String,
    pub kubectl_version: String,
    pub app_state_informer: AppStateInformerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppStateInformerConfig {
    /// Only watch namespaced resources in this namespace; empty watches all.
    pub namespace: String,
    pub include_resources: Vec<KubernetesResourceMatcher>,
    pub exclude_resources: Vec<KubernetesResourceMatcher>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesResourceMatcher {
    pub api_version: String,
    /// Empty matches every kind of `api_version`.
    pub kind: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualOperation {
    #[default]
    None,
    Skip,
    Approve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickSyncStage {
    pub name: String,
    pub description: String,
    pub rollback: bool,
    pub metadata: BTreeMap<String, String>,
    pub available_operation: ManualOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub index: usize,
    pub name: String,
    pub rollback: bool,
}

/// A user-configured pipeline stage as delivered by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub index: usize,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceHealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A live resource as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub id: String,
    pub parent_ids: SmallVec<[String; 2]>,
    pub name: String,
    pub resource_type: String,
    pub resource_metadata: BTreeMap<String, String>,
    pub health_status: ResourceHealthStatus,
    pub health_description: String,
    pub deploy_target: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    #[default]
    Unknown,
    Synced,
    OutOfSync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    pub short_reason: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationLiveState {
    pub resources: Vec<ResourceState>,
    pub health_status: ResourceHealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    ContainerImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVersion {
    pub kind: ArtifactKind,
    pub version: String,
    pub name: String,
    pub url: String,
}
