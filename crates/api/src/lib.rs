//! piped-k8s plugin API façade (in-process).
//!
//! This crate defines the single surface a plugin host drives: stage
//! execution, live state, stage lists, plan preview and the planner queries.
//! The implementation here calls the deploy crates directly.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use pipedk8s_core::{
    ArtifactVersion, DeployTarget, DeploymentSource, PipelineStage, QuickSyncStage, StageConfig, StageLogPersister,
    StageStatus, Tools,
};
use pipedk8s_deploy::{
    build_pipeline_stages, build_quick_sync_stages, Deployer, LivestateReport, PlanPreviewResult, StageName, StageRequest,
    StrategyDecision, ToolKubectlResolver,
};
use pipedk8s_loader::Loader;
use pipedk8s_store::StoreManager;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// API errors suitable for transport over the plugin wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PluginError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Deployment plugin surface for one platform.
#[async_trait::async_trait]
pub trait DeploymentPlugin: Send + Sync {
    /// Every stage name this plugin can execute.
    fn fetch_defined_stages(&self) -> Vec<String>;

    /// Start live-state tracking for the given deploy targets.
    async fn initialize(&self, targets: &[DeployTarget]) -> PluginResult<()>;

    /// Run one stage. Failures inside the stage are reported through the
    /// returned status and `lp`, not as errors.
    async fn execute_stage(
        &self,
        req: &StageRequest,
        targets: &[DeployTarget],
        lp: &dyn StageLogPersister,
        cancel: &CancellationToken,
    ) -> PluginResult<StageStatus>;

    async fn get_livestate(
        &self,
        app_id: &str,
        app_name: &str,
        source: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<LivestateReport>;

    fn build_quick_sync_stages(&self, auto_rollback: bool) -> Vec<QuickSyncStage>;

    fn build_pipeline_sync_stages(&self, stages: &[StageConfig], auto_rollback: bool) -> Vec<PipelineStage>;

    async fn plan_preview(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<Vec<PlanPreviewResult>>;

    async fn determine_strategy(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<StrategyDecision>;

    async fn determine_versions(
        &self,
        app_name: &str,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<Vec<ArtifactVersion>>;

    /// Stop live-state tracking.
    async fn shutdown(&self);
}

/// Kubernetes implementation of [`DeploymentPlugin`].
pub struct KubernetesPlugin {
    deployer: Deployer,
}

impl KubernetesPlugin {
    /// Plugin resolving kubectl/helm/kustomize through `tools`.
    pub fn new(tools: Tools) -> Self {
        let loader = Arc::new(Loader::new(tools.clone()));
        let kubectl = Arc::new(ToolKubectlResolver::new(tools));
        Self { deployer: Deployer::new(loader, kubectl, Arc::new(StoreManager::new())) }
    }

    pub fn with_deployer(deployer: Deployer) -> Self { Self { deployer } }

    pub fn deployer(&self) -> &Deployer { &self.deployer }

    fn map_err(e: anyhow::Error) -> PluginError { PluginError::Internal(format!("{:#}", e)) }

    fn first_target(targets: &[DeployTarget]) -> PluginResult<&DeployTarget> {
        targets.first().ok_or_else(|| PluginError::Validation("at least one deploy target is required".into()))
    }
}

#[async_trait::async_trait]
impl DeploymentPlugin for KubernetesPlugin {
    fn fetch_defined_stages(&self) -> Vec<String> { StageName::defined() }

    async fn initialize(&self, targets: &[DeployTarget]) -> PluginResult<()> {
        let t0 = Instant::now();
        for target in targets {
            if let Err(e) = self.deployer.stores().initialize(target).await {
                warn!(target = %target.name, error = %format!("{:#}", e), "api: live-state store failed to start");
                return Err(Self::map_err(e));
            }
        }
        info!(targets = targets.len(), took_ms = %t0.elapsed().as_millis(), "api: initialize ok");
        Ok(())
    }

    async fn execute_stage(
        &self,
        req: &StageRequest,
        targets: &[DeployTarget],
        lp: &dyn StageLogPersister,
        cancel: &CancellationToken,
    ) -> PluginResult<StageStatus> {
        let status = self.deployer.execute_stage(req, targets, lp, cancel).await;
        lp.complete(Duration::from_secs(10));
        Ok(status)
    }

    async fn get_livestate(
        &self,
        app_id: &str,
        app_name: &str,
        source: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<LivestateReport> {
        let t0 = Instant::now();
        if targets.is_empty() {
            return Err(PluginError::Validation("at least one deploy target is required".into()));
        }
        let report = self.deployer.get_livestate(app_id, app_name, source, targets).await.map_err(Self::map_err)?;
        info!(
            app_id,
            resources = report.resources.len(),
            status = ?report.sync_state.status,
            took_ms = %t0.elapsed().as_millis(),
            "api: livestate ok"
        );
        Ok(report)
    }

    fn build_quick_sync_stages(&self, auto_rollback: bool) -> Vec<QuickSyncStage> { build_quick_sync_stages(auto_rollback) }

    fn build_pipeline_sync_stages(&self, stages: &[StageConfig], auto_rollback: bool) -> Vec<PipelineStage> {
        build_pipeline_stages(stages, auto_rollback)
    }

    async fn plan_preview(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<Vec<PlanPreviewResult>> {
        let t0 = Instant::now();
        let results = self.deployer.plan_preview(app_name, running, target, targets).await.map_err(Self::map_err)?;
        info!(app = app_name, targets = results.len(), took_ms = %t0.elapsed().as_millis(), "api: plan preview ok");
        Ok(results)
    }

    async fn determine_strategy(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<StrategyDecision> {
        let dt = Self::first_target(targets)?;
        self.deployer.determine_strategy(app_name, running, target, dt).await.map_err(Self::map_err)
    }

    async fn determine_versions(
        &self,
        app_name: &str,
        target: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> PluginResult<Vec<ArtifactVersion>> {
        let dt = Self::first_target(targets)?;
        self.deployer.determine_versions(app_name, target, dt).await.map_err(Self::map_err)
    }

    async fn shutdown(&self) { self.deployer.stores().shutdown().await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipedk8s_apply::{InMemoryKubectl, KubectlOps};
    use pipedk8s_core::{BufferLogPersister, LocalToolRegistry};
    use pipedk8s_deploy::FixedKubectl;

    fn plugin() -> (KubernetesPlugin, Arc<InMemoryKubectl>) {
        let k = Arc::new(InMemoryKubectl::new());
        let tools = Tools::new(Arc::new(LocalToolRegistry::new(std::env::temp_dir().join("pipedk8s-api-tools"))));
        let kubectl: Arc<dyn KubectlOps> = k.clone();
        let deployer = Deployer::new(Arc::new(Loader::new(tools)), Arc::new(FixedKubectl(kubectl)), Arc::new(StoreManager::new()));
        (KubernetesPlugin::with_deployer(deployer), k)
    }

    #[test]
    fn defined_stages_cover_every_stage() {
        let (p, _) = plugin();
        let stages = p.fetch_defined_stages();
        assert_eq!(stages.len(), 8);
        assert!(stages.contains(&"K8S_TRAFFIC_ROUTING".to_string()));
        assert!(stages.contains(&"K8S_ROLLBACK".to_string()));
    }

    #[test]
    fn stage_lists_delegate() {
        let (p, _) = plugin();
        assert_eq!(p.build_quick_sync_stages(true).len(), 2);
        let cfg = vec![StageConfig { index: 0, name: "K8S_PRIMARY_ROLLOUT".into(), ..Default::default() }];
        let stages = p.build_pipeline_sync_stages(&cfg, false);
        assert_eq!(stages, vec![PipelineStage { index: 0, name: "K8S_PRIMARY_ROLLOUT".into(), rollback: false }]);
    }

    #[tokio::test]
    async fn planner_queries_need_a_target() {
        let (p, _) = plugin();
        let src = DeploymentSource::default();
        let err = p.determine_strategy("app", &src, &src, &[]).await.unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
        let err = p.get_livestate("app-id", "app", &src, &[]).await.unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
    }

    #[tokio::test]
    async fn stage_errors_become_a_status() {
        let (p, k) = plugin();
        let lp = BufferLogPersister::new();
        let req = StageRequest { stage_name: "K8S_SYNC".into(), ..Default::default() };
        let status = p.execute_stage(&req, &[], &lp, &CancellationToken::new()).await.unwrap();
        assert_eq!(status, StageStatus::Failure);
        assert!(lp.contains("Only 1 deploy target is allowed but got 0"));
        assert!(k.ops().is_empty());
    }

    #[test]
    fn error_is_transportable() {
        let e = PluginError::NotFound("store".into());
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"NotFound":"store"}"#);
        assert_eq!(serde_json::from_str::<PluginError>(&json).unwrap(), e);
        assert_eq!(e.to_string(), "not_found: store");
    }
}
