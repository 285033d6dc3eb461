use anyhow::Result;
use pipedk8s_core::{labels, StageStatus};

use super::{ensure_variant_selector, prune};
use crate::executor::StageContext;
use crate::provenance::{add_builtin_annotations, annotate_config_hash};

/// Apply every manifest of the target commit as the primary variant,
/// optionally pruning what Git no longer defines.
pub(super) async fn run(ctx: &StageContext<'_>) -> Result<StageStatus> {
    ctx.lp.info("Start syncing the deployment");
    let source = &ctx.req.target;
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

    if !spec.quick_sync.prune {
        ctx.lp.info("Resource GC was skipped because sync.prune was not configured");
        return Ok(StageStatus::Success);
    }
    prune(ctx, &applier, &manifests, &labels::application_selector(ctx.app_id())).await
}
