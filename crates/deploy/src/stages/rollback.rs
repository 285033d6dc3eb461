use anyhow::{bail, Result};
use pipedk8s_core::StageStatus;

use super::{delete_variant_resources, ensure_variant_selector};
use crate::executor::StageContext;
use crate::provenance::{add_builtin_annotations, annotate_config_hash};

/// Re-apply the running commit as the primary variant and drop the canary
/// and baseline variants.
pub(super) async fn run(ctx: &StageContext<'_>) -> Result<StageStatus> {
    let source = &ctx.req.running;
    if source.commit_hash.is_empty() {
        bail!("unable to determine the last deployed commit to rollback; it seems this is the first deployment");
    }
    ctx.lp.info("Start rolling back the deployment");
    let spec = &source.application_config.spec;
    let vl = &spec.variant_label;

    let mut manifests = ctx.load(source).await?;
    if spec.quick_sync.add_variant_label_to_selector {
        ensure_variant_selector(&mut manifests, &spec.workloads, &vl.key, &vl.primary_value)?;
    }
    add_builtin_annotations(&mut manifests, &vl.key, &vl.primary_value, ctx.provenance(&source.commit_hash))?;
    annotate_config_hash(&mut manifests, &spec.workloads)?;

    let applier = ctx.applier(spec).await?;
    ctx.apply(&applier, &manifests).await?;

    let canary = delete_variant_resources(ctx, &applier, &vl.key, &vl.canary_value).await?;
    let baseline = delete_variant_resources(ctx, &applier, &vl.key, &vl.baseline_value).await?;
    if canary == StageStatus::Failure || baseline == StageStatus::Failure {
        return Ok(StageStatus::Failure);
    }
    Ok(StageStatus::Success)
}
