//! Plan preview, strategy and version queries over deployment sources.

use anyhow::Result;
use pipedk8s_core::{ArtifactVersion, DeployTarget, DeploymentSource, SyncStrategy};
use pipedk8s_diff::{diff_list, DiffOptions, DiffRenderOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::determiner::{determine_strategy, determine_versions};
use crate::executor::Deployer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPreviewResult {
    pub deploy_target: String,
    pub no_change: bool,
    pub summary: String,
    pub diff_language: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub strategy: SyncStrategy,
    pub summary: String,
}

impl StrategyDecision {
    fn new(strategy: SyncStrategy, summary: impl Into<String>) -> Self { Self { strategy, summary: summary.into() } }
}

impl Deployer {
    /// What applying `target` would change, per deploy target.
    pub async fn plan_preview(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        deploy_targets: &[DeployTarget],
    ) -> Result<Vec<PlanPreviewResult>> {
        let opts = DiffOptions::default().with_equate_empty().with_compare_number_and_numeric_string();
        let mut out = Vec::with_capacity(deploy_targets.len());
        for dt in deploy_targets {
            let olds = if running.is_empty() { Vec::new() } else { self.load_manifests(running, app_name, dt).await? };
            let news = self.load_manifests(target, app_name, dt).await?;
            let result = diff_list(&olds, &news, &opts);
            if result.no_changes() {
                out.push(PlanPreviewResult {
                    deploy_target: dt.name.clone(),
                    no_change: true,
                    summary: "No changes were detected".to_string(),
                    diff_language: "diff".to_string(),
                    details: String::new(),
                });
                continue;
            }
            let summary = format!(
                "{} added manifests, {} changed manifests, {} deleted manifests",
                result.adds.len(),
                result.changes.len(),
                result.deletes.len()
            );
            info!(app = app_name, target = %dt.name, %summary, "plan preview");
            let details = result.render(&DiffRenderOptions { mask_secret: true, use_diff_command: true, ..Default::default() });
            out.push(PlanPreviewResult {
                deploy_target: dt.name.clone(),
                no_change: false,
                summary,
                diff_language: "diff".to_string(),
                details,
            });
        }
        Ok(out)
    }

    /// Quick sync or pipeline for moving from `running` to `target`.
    pub async fn determine_strategy(
        &self,
        app_name: &str,
        running: &DeploymentSource,
        target: &DeploymentSource,
        deploy_target: &DeployTarget,
    ) -> Result<StrategyDecision> {
        let spec = &target.application_config.spec;
        let has_pipeline = spec.pipeline.as_ref().is_some_and(|p| !p.stages.is_empty());
        if !has_pipeline {
            return Ok(StrategyDecision::new(
                SyncStrategy::QuickSync,
                "Quick sync by applying all manifests because no pipeline was configured",
            ));
        }
        if spec.planner.always_use_pipeline {
            return Ok(StrategyDecision::new(SyncStrategy::Pipeline, "Sync with the specified pipeline (alwaysUsePipeline was set)"));
        }
        if running.is_empty() {
            return Ok(StrategyDecision::new(
                SyncStrategy::QuickSync,
                "Quick sync, it seems this is the first deployment of the application",
            ));
        }
        let olds = self.load_manifests(running, app_name, deploy_target).await?;
        let news = self.load_manifests(target, app_name, deploy_target).await?;
        let (strategy, summary) = determine_strategy(&olds, &news, &spec.workloads);
        Ok(StrategyDecision { strategy, summary })
    }

    /// Container images the target commit deploys.
    pub async fn determine_versions(
        &self,
        app_name: &str,
        target: &DeploymentSource,
        deploy_target: &DeployTarget,
    ) -> Result<Vec<ArtifactVersion>> {
        let manifests = self.load_manifests(target, app_name, deploy_target).await?;
        Ok(determine_versions(&manifests, &target.application_config.spec.workloads))
    }
}
