use anyhow::{bail, Context, Result};
use pipedk8s_core::config::{
    parse_stage_options, K8sPrimaryRolloutStageOptions, KubernetesApplicationSpec, TrafficRoutingMethod,
};
use pipedk8s_core::{labels, Manifest, StageStatus};

use super::{ensure_variant_selector, prune};
use crate::executor::StageContext;
use crate::provenance::{add_builtin_annotations, annotate_config_hash};
use crate::variant::{find_services, generate_variant_services};

/// Primary manifests for pod-selector routing: the variant in the workload
/// selectors if asked, plus a `-<suffix>` Service when `createService` is set.
pub(crate) fn generate_primary_manifests(
    mut manifests: Vec<Manifest>,
    spec: &KubernetesApplicationSpec,
    opts: &K8sPrimaryRolloutStageOptions,
) -> Result<Vec<Manifest>> {
    let vl = &spec.variant_label;
    let suffix = if opts.suffix.is_empty() { vl.primary_value.as_str() } else { opts.suffix.as_str() };
    if opts.add_variant_label_to_selector {
        ensure_variant_selector(&mut manifests, &spec.workloads, &vl.key, &vl.primary_value)?;
    }
    if !opts.create_service {
        return Ok(manifests);
    }
    let services = find_services(&manifests, &spec.service);
    if services.is_empty() {
        bail!("unable to find any service for name={:?}", spec.service.name);
    }
    let generated = generate_variant_services(&services, &vl.key, &vl.primary_value, suffix)?;
    manifests.extend(generated);
    Ok(manifests)
}

pub(super) async fn rollout(ctx: &StageContext<'_>) -> Result<StageStatus> {
    let source = &ctx.req.target;
    let spec = &source.application_config.spec;
    let vl = &spec.variant_label;
    let opts: K8sPrimaryRolloutStageOptions =
        parse_stage_options(&ctx.req.stage_config).context("Invalid K8S_PRIMARY_ROLLOUT options")?;

    let manifests = ctx.load(source).await?;
    if manifests.is_empty() {
        bail!("This application has no Kubernetes manifests to handle");
    }
    let mut manifests = match spec.traffic_routing_method() {
        TrafficRoutingMethod::PodSelector => generate_primary_manifests(manifests, spec, &opts)?,
        TrafficRoutingMethod::Istio => manifests,
    };
    add_builtin_annotations(&mut manifests, &vl.key, &vl.primary_value, ctx.provenance(&source.commit_hash))?;
    annotate_config_hash(&mut manifests, &spec.workloads)?;

    let applier = ctx.applier(spec).await?;
    ctx.lp.info("Start rolling out PRIMARY variant...");
    ctx.apply(&applier, &manifests).await?;
    ctx.lp.success("Successfully rolled out PRIMARY variant");

    if !opts.prune {
        ctx.lp.info("Resource GC was skipped because prune was not configured");
        return Ok(StageStatus::Success);
    }
    let mut selector = labels::application_selector(ctx.app_id());
    selector.push(format!("{}={}", vl.key, vl.primary_value));
    prune(ctx, &applier, &manifests, &selector).await
}
