use anyhow::{bail, Context, Result};
use pipedk8s_core::config::{parse_stage_options, K8sTrafficRoutingStageOptions, KubernetesVariantLabel, TrafficRoutingMethod};
use pipedk8s_core::{Manifest, StageStatus};

use crate::executor::StageContext;
use crate::provenance::add_builtin_annotations;
use crate::variant::find_services;

/// The variant receiving all traffic; pod-selector routing cannot split it.
pub(crate) fn routed_variant<'a>(opts: &K8sTrafficRoutingStageOptions, vl: &'a KubernetesVariantLabel) -> Result<&'a str> {
    match opts.percentages() {
        (100, 0, 0) => Ok(vl.primary_value.as_str()),
        (0, 100, 0) => Ok(vl.canary_value.as_str()),
        (0, 0, 100) => Ok(vl.baseline_value.as_str()),
        (p, c, b) => bail!(
            "traffic routing by pod requires either PRIMARY, CANARY or BASELINE must be 100 (primary={}, canary={}, baseline={})",
            p,
            c,
            b
        ),
    }
}

pub(super) async fn run(ctx: &StageContext<'_>) -> Result<StageStatus> {
    let source = &ctx.req.target;
    let spec = &source.application_config.spec;
    let vl = &spec.variant_label;
    let opts: K8sTrafficRoutingStageOptions =
        parse_stage_options(&ctx.req.stage_config).context("Invalid K8S_TRAFFIC_ROUTING options")?;

    if spec.traffic_routing_method() == TrafficRoutingMethod::Istio {
        bail!("Traffic routing by istio is not yet implemented");
    }
    let variant = routed_variant(&opts, vl)?;

    let manifests = ctx.load(source).await?;
    if manifests.is_empty() {
        bail!("This application has no Kubernetes manifests to handle");
    }
    let services = find_services(&manifests, &spec.service);
    if services.is_empty() {
        bail!("unable to find any service for name={:?}", spec.service.name);
    }
    let mut routed: Vec<Manifest> = services.into_iter().cloned().collect();
    for s in routed.iter_mut() {
        s.add_string_map_values([(vl.key.as_str(), variant)], &["spec", "selector"])?;
    }
    add_builtin_annotations(&mut routed, &vl.key, &vl.primary_value, ctx.provenance(&source.commit_hash))?;

    let applier = ctx.applier(spec).await?;
    ctx.lp.info(&format!("Start routing all traffic to {} variant", variant));
    ctx.apply(&applier, &routed).await?;
    ctx.lp.success(&format!("Successfully routed all traffic to {} variant", variant));
    Ok(StageStatus::Success)
}
