//! Removing live resources that are no longer part of the application.

use std::collections::BTreeSet;

use pipedk8s_apply::Applier;
use pipedk8s_core::{Manifest, ResourceKey, StageLogPersister};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keys of live resources with no counterpart in `manifests`. Namespaced
/// resources compare by normalized key, cluster-scoped ones by exact key.
pub fn find_remove_resources(manifests: &[Manifest], namespaced: &[Manifest], cluster_scoped: &[Manifest]) -> Vec<ResourceKey> {
    let normalized: BTreeSet<ResourceKey> = manifests.iter().map(|m| m.key().normalize()).collect();
    let exact: BTreeSet<ResourceKey> = manifests.iter().map(|m| m.key()).collect();

    let mut out = Vec::with_capacity(namespaced.len() + cluster_scoped.len());
    out.extend(namespaced.iter().map(|r| r.key()).filter(|k| !normalized.contains(&k.normalize())));
    out.extend(cluster_scoped.iter().map(|r| r.key()).filter(|k| !exact.contains(k)));
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DeleteReport {
    /// Only a run that deleted nothing and hit a hard error fails.
    pub fn is_failure(&self) -> bool { self.deleted == 0 && self.failed > 0 }
}

/// Best-effort delete of every key; missing or foreign objects are skipped.
/// Stops before the next delete once `cancel` fires.
pub async fn delete_resources(
    applier: &Applier,
    keys: &[ResourceKey],
    lp: &dyn StageLogPersister,
    cancel: &CancellationToken,
) -> DeleteReport {
    let mut report = DeleteReport::default();
    if keys.is_empty() {
        lp.info("No resources to delete");
        return report;
    }
    lp.info(&format!("Start deleting {} resources", keys.len()));
    for key in keys {
        if cancel.is_cancelled() {
            warn!(remaining = keys.len() - report.deleted - report.skipped - report.failed, "delete cancelled");
            break;
        }
        match applier.delete(key).await {
            Ok(()) => {
                report.deleted += 1;
                lp.success(&format!("- deleted resource: {}", key.readable_string()));
            }
            Err(e) if e.is_not_found() => {
                report.skipped += 1;
                lp.info(&format!(
                    "Specified resource does not exist, so skip deleting the resource: {} ({})",
                    key.readable_string(),
                    e
                ));
            }
            Err(e) => {
                report.failed += 1;
                lp.error(&format!("Failed while deleting resource {} ({})", key.readable_string(), e));
            }
        }
    }
    info!(deleted = report.deleted, skipped = report.skipped, failed = report.failed, "deleted resources");
    lp.success(&format!("Successfully deleted {} resources", report.deleted));
    report
}
