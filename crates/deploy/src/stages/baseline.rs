use anyhow::{bail, Context, Result};
use pipedk8s_core::config::{parse_stage_options, K8sBaselineRolloutStageOptions};
use pipedk8s_core::StageStatus;

use super::delete_variant_resources;
use crate::executor::StageContext;
use crate::provenance::add_builtin_annotations;
use crate::variant::{find_services, find_workloads, generate_variant_services, generate_variant_workloads};

/// Copies of the running workloads (and optionally Services) under the
/// baseline variant.
pub(super) async fn rollout(ctx: &StageContext<'_>) -> Result<StageStatus> {
    let source = &ctx.req.running;
    if source.is_empty() {
        bail!("unable to determine the last deployed commit to roll out BASELINE variant");
    }
    let spec = &source.application_config.spec;
    let vl = &spec.variant_label;
    let opts: K8sBaselineRolloutStageOptions =
        parse_stage_options(&ctx.req.stage_config).context("Invalid K8S_BASELINE_ROLLOUT options")?;
    let suffix = if opts.suffix.is_empty() { vl.baseline_value.as_str() } else { opts.suffix.as_str() };

    let manifests = ctx.load(source).await?;
    if manifests.is_empty() {
        bail!("This application has no running Kubernetes manifests to handle");
    }
    let workloads = find_workloads(&manifests, &spec.workloads);
    if workloads.is_empty() {
        bail!("unable to find any workload manifests for BASELINE variant");
    }

    let mut baseline = Vec::new();
    if opts.create_service {
        let services = find_services(&manifests, &spec.service);
        if services.is_empty() {
            bail!("unable to find any service for name={:?}", spec.service.name);
        }
        baseline.extend(generate_variant_services(&services, &vl.key, &vl.baseline_value, suffix)?);
    }
    let replicas = |current: Option<u32>| opts.replicas.calculate(current.unwrap_or(1), 1);
    baseline.extend(generate_variant_workloads(&workloads, &vl.key, &vl.baseline_value, suffix, replicas)?);
    add_builtin_annotations(&mut baseline, &vl.key, &vl.baseline_value, ctx.provenance(&source.commit_hash))?;

    let applier = ctx.applier(spec).await?;
    ctx.lp.info("Start rolling out BASELINE variant...");
    ctx.apply(&applier, &baseline).await?;
    ctx.lp.success("Successfully rolled out BASELINE variant");
    Ok(StageStatus::Success)
}

pub(super) async fn clean(ctx: &StageContext<'_>) -> Result<StageStatus> {
    ctx.lp.info("Start cleaning BASELINE variant");
    let spec = &ctx.req.target.application_config.spec;
    let applier = ctx.applier(spec).await?;
    delete_variant_resources(ctx, &applier, &spec.variant_label.key, &spec.variant_label.baseline_value).await
}
