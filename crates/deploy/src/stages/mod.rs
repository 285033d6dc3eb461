//! Stage bodies and the steps they share.

use anyhow::{Context, Result};
use pipedk8s_apply::Applier;
use pipedk8s_core::config::K8sResourceReference;
use pipedk8s_core::{labels, Manifest, ResourceKey, StageStatus};

use crate::executor::StageContext;
use crate::provenance::ensure_variant_selector_in_workload;
use crate::prune::{delete_resources, find_remove_resources};
use crate::stage::StageName;
use crate::variant::find_workloads;

mod baseline;
mod canary;
mod primary;
mod rollback;
mod sync;
mod traffic;

pub(crate) async fn run(stage: StageName, ctx: &StageContext<'_>) -> Result<StageStatus> {
    match stage {
        StageName::Sync => sync::run(ctx).await,
        StageName::PrimaryRollout => primary::rollout(ctx).await,
        StageName::CanaryRollout => canary::rollout(ctx).await,
        StageName::CanaryClean => canary::clean(ctx).await,
        StageName::BaselineRollout => baseline::rollout(ctx).await,
        StageName::BaselineClean => baseline::clean(ctx).await,
        StageName::TrafficRouting => traffic::run(ctx).await,
        StageName::Rollback => rollback::run(ctx).await,
    }
}

/// Add the variant to the selector of every workload in `manifests`.
pub(crate) fn ensure_variant_selector(
    manifests: &mut [Manifest],
    workload_refs: &[K8sResourceReference],
    variant_key: &str,
    variant: &str,
) -> Result<()> {
    let keys: Vec<ResourceKey> = find_workloads(manifests, workload_refs).iter().map(|m| m.key()).collect();
    for m in manifests.iter_mut().filter(|m| keys.contains(&m.key())) {
        let readable = m.key().readable_string();
        ensure_variant_selector_in_workload(m, variant_key, variant).with_context(|| {
            format!("Unable to check/set \"{}: {}\" in selector of workload {}", variant_key, variant, readable)
        })?;
    }
    Ok(())
}

/// Live objects matching `selector`: namespaced ones across all namespaces,
/// then cluster-scoped ones.
pub(crate) async fn live_resources(applier: &Applier, selector: &[String]) -> Result<(Vec<Manifest>, Vec<Manifest>)> {
    let kubectl = applier.kubectl();
    let namespaced = kubectl.get_all(applier.kubeconfig(), "", selector).await?;
    let cluster_scoped = kubectl.get_all_cluster_scoped(applier.kubeconfig(), selector).await?;
    Ok((namespaced, cluster_scoped))
}

fn status_of(failed: bool) -> StageStatus {
    if failed { StageStatus::Failure } else { StageStatus::Success }
}

/// Wait for the applied objects to settle, then delete live objects matched
/// by `selector` that `manifests` no longer define.
pub(crate) async fn prune(
    ctx: &StageContext<'_>,
    applier: &Applier,
    manifests: &[Manifest],
    selector: &[String],
) -> Result<StageStatus> {
    ctx.lp.info("Waiting for the applied manifests to be stable");
    tokio::time::sleep(ctx.prune_wait()).await;

    ctx.lp.info("Start finding all running resources but no longer defined in Git");
    let (namespaced, cluster_scoped) =
        live_resources(applier, selector).await.context("Failed while getting live resources to prune")?;
    if namespaced.is_empty() && cluster_scoped.is_empty() {
        ctx.lp.info("There is no data about live resource so no resource will be removed");
        return Ok(StageStatus::Success);
    }
    ctx.lp.success(&format!("Successfully loaded {} live resources", namespaced.len() + cluster_scoped.len()));

    let keys = find_remove_resources(manifests, &namespaced, &cluster_scoped);
    if keys.is_empty() {
        ctx.lp.info("There are no live resources should be removed");
        return Ok(StageStatus::Success);
    }
    ctx.lp.info(&format!("Start pruning {} resources", keys.len()));
    let report = delete_resources(applier, &keys, ctx.lp, ctx.cancel).await;
    Ok(status_of(report.is_failure()))
}

/// Delete every live object of the application carrying `variant`.
/// Services go first so traffic stops before the pods do.
pub(crate) async fn delete_variant_resources(
    ctx: &StageContext<'_>,
    applier: &Applier,
    variant_key: &str,
    variant: &str,
) -> Result<StageStatus> {
    ctx.lp.info(&format!("Start deleting all resources of {} variant", variant));
    let mut selector = labels::application_selector(ctx.app_id());
    selector.push(format!("{}={}", variant_key, variant));
    let (namespaced, cluster_scoped) = live_resources(applier, &selector)
        .await
        .with_context(|| format!("Unable to get live resources of {} variant", variant))?;
    if namespaced.is_empty() && cluster_scoped.is_empty() {
        ctx.lp.info(&format!("No {} resources to delete", variant));
        return Ok(StageStatus::Success);
    }
    let mut keys: Vec<ResourceKey> = namespaced.iter().chain(cluster_scoped.iter()).map(|m| m.key()).collect();
    keys.sort_by_key(|k| !k.is_service());
    let report = delete_resources(applier, &keys, ctx.lp, ctx.cancel).await;
    Ok(status_of(report.is_failure()))
}
