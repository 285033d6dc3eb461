//! Running one stage of a deployment against its deploy target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use pipedk8s_apply::{apply_manifests, Applier, KubectlOps};
use pipedk8s_core::config::KubernetesApplicationSpec;
use pipedk8s_core::{DeployTarget, Deployment, DeploymentSource, Manifest, StageLogPersister, StageStatus};
use pipedk8s_loader::{Loader, LoaderInput};
use pipedk8s_store::StoreManager;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::provenance::Provenance;
use crate::resolver::KubectlResolver;
use crate::stage::StageName;
use crate::stages;

pub const DEFAULT_PRUNE_WAIT: Duration = Duration::from_secs(15);

/// Stabilization wait before pruning; `PIPED_K8S_PRUNE_WAIT_SECS` overrides.
pub fn prune_wait_from_env() -> Duration {
    std::env::var("PIPED_K8S_PRUNE_WAIT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PRUNE_WAIT)
}

/// Everything the host hands over to run a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StageRequest {
    pub stage_name: String,
    /// Raw stage options (JSON); empty means defaults.
    pub stage_config: Vec<u8>,
    pub running: DeploymentSource,
    pub target: DeploymentSource,
    pub deployment: Deployment,
}

pub struct Deployer {
    pub(crate) loader: Arc<Loader>,
    pub(crate) kubectl: Arc<dyn KubectlResolver>,
    pub(crate) stores: Arc<StoreManager>,
    pub(crate) prune_wait: Duration,
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Deployer {
    pub fn new(loader: Arc<Loader>, kubectl: Arc<dyn KubectlResolver>, stores: Arc<StoreManager>) -> Self {
        Self { loader, kubectl, stores, prune_wait: prune_wait_from_env(), locks: Mutex::new(FxHashMap::default()) }
    }

    pub fn with_prune_wait(mut self, wait: Duration) -> Self {
        self.prune_wait = wait;
        self
    }

    pub fn stores(&self) -> &Arc<StoreManager> { &self.stores }

    fn target_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(name.to_string()).or_default())
    }

    /// Render the manifests of `source` for `target`.
    pub async fn load_manifests(&self, source: &DeploymentSource, app_name: &str, target: &DeployTarget) -> Result<Vec<Manifest>> {
        let spec = &source.application_config.spec;
        let li = LoaderInput {
            app_dir: source.application_directory.clone(),
            app_name: if spec.name.is_empty() { app_name.to_string() } else { spec.name.clone() },
            commit: source.commit_hash.clone(),
            config_filename: source.application_config_filename.clone(),
            target_name: target.name.clone(),
            input: spec.input.clone(),
        };
        self.loader
            .load_manifests(&li)
            .await
            .with_context(|| format!("Failed while loading manifests at commit {}", source.commit_hash))
    }

    /// The application's kubectl version wins over the deploy target's.
    pub(crate) async fn kubectl_for(&self, spec: &KubernetesApplicationSpec, target: &DeployTarget) -> Result<Arc<dyn KubectlOps>> {
        let input = spec.input.for_target(&target.name);
        let version = if input.kubectl_version.is_empty() { &target.config.kubectl_version } else { &input.kubectl_version };
        self.kubectl.kubectl(version).await.with_context(|| format!("Failed to get kubectl for deploy target {}", target.name))
    }

    pub(crate) async fn applier_for(&self, spec: &KubernetesApplicationSpec, target: &DeployTarget) -> Result<Applier> {
        let kubectl = self.kubectl_for(spec, target).await?;
        Ok(Applier::new(kubectl, &spec.input.for_target(&target.name), &target.config))
    }

    /// Run `req` to completion or until `cancel` fires, in which case the
    /// stage reports `Exited`.
    pub async fn execute_stage(
        &self,
        req: &StageRequest,
        targets: &[DeployTarget],
        lp: &dyn StageLogPersister,
        cancel: &CancellationToken,
    ) -> StageStatus {
        let t0 = Instant::now();
        let status = self.run_stage(req, targets, lp, cancel).await;
        let took_ms = t0.elapsed().as_millis() as u64;
        counter!("stage_executions_total", 1u64, "stage" => req.stage_name.clone(), "status" => status.to_string());
        histogram!("stage_ms", took_ms as f64, "stage" => req.stage_name.clone());
        info!(
            app_id = %req.deployment.application_id,
            deployment = %req.deployment.id,
            stage = %req.stage_name,
            %status,
            took_ms,
            "stage finished"
        );
        status
    }

    async fn run_stage(
        &self,
        req: &StageRequest,
        targets: &[DeployTarget],
        lp: &dyn StageLogPersister,
        cancel: &CancellationToken,
    ) -> StageStatus {
        let stage = match req.stage_name.parse::<StageName>() {
            Ok(s) => s,
            Err(e) => {
                lp.error(&e.to_string());
                return StageStatus::Failure;
            }
        };
        let target = match targets {
            [t] => t,
            _ => {
                lp.error(&format!("Only 1 deploy target is allowed but got {}", targets.len()));
                return StageStatus::Failure;
            }
        };

        let lock = self.target_lock(&target.name);
        let ctx = StageContext { deployer: self, req, target, lp, cancel };
        let body = async {
            let _guard = lock.lock().await;
            stages::run(stage, &ctx).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(stage = %stage, "stage cancelled");
                lp.info("The stage was cancelled");
                StageStatus::Exited
            }
            res = body => match res {
                Ok(status) => status,
                Err(e) => {
                    lp.error(&format!("{:#}", e));
                    StageStatus::Failure
                }
            },
        }
    }
}

/// What a stage body sees.
pub(crate) struct StageContext<'a> {
    pub deployer: &'a Deployer,
    pub req: &'a StageRequest,
    pub target: &'a DeployTarget,
    pub lp: &'a dyn StageLogPersister,
    pub cancel: &'a CancellationToken,
}

impl StageContext<'_> {
    pub fn app_id(&self) -> &str { &self.req.deployment.application_id }

    pub fn provenance<'b>(&'b self, commit: &'b str) -> Provenance<'b> {
        Provenance { piped_id: &self.req.deployment.piped_id, app_id: self.app_id(), commit }
    }

    pub async fn load(&self, source: &DeploymentSource) -> Result<Vec<Manifest>> {
        self.lp.info(&format!("Loading manifests at commit {} for handling", source.commit_hash));
        let manifests =
            self.deployer.load_manifests(source, &self.req.deployment.application_name, self.target).await?;
        self.lp.success(&format!("Successfully loaded {} manifests", manifests.len()));
        Ok(manifests)
    }

    pub async fn applier(&self, spec: &KubernetesApplicationSpec) -> Result<Applier> {
        self.deployer.applier_for(spec, self.target).await
    }

    pub async fn apply(&self, applier: &Applier, manifests: &[Manifest]) -> Result<()> {
        apply_manifests(applier, manifests, self.lp).await.context("Failed while applying manifests")
    }

    pub fn prune_wait(&self) -> Duration { self.deployer.prune_wait }
}
