use anyhow::{bail, Result};
use pipedk8s_core::StageStatus;

use super::delete_variant_resources;
use crate::executor::StageContext;

/// Canary rollout is unsupported; the stage logs its start and reports failure.
pub(super) async fn rollout(ctx: &StageContext<'_>) -> Result<StageStatus> {
    ctx.lp.info("Start canary rollout");
    bail!("K8S_CANARY_ROLLOUT is not yet implemented")
}

pub(super) async fn clean(ctx: &StageContext<'_>) -> Result<StageStatus> {
    ctx.lp.info("Start cleaning CANARY variant");
    let spec = &ctx.req.target.application_config.spec;
    let applier = ctx.applier(spec).await?;
    delete_variant_resources(ctx, &applier, &spec.variant_label.key, &spec.variant_label.canary_value).await
}
