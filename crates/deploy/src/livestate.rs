//! Live resources of an application and their drift from Git.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use chrono::Utc;
use pipedk8s_core::{
    labels, ApplicationSyncState, ApplicationSyncStatus, DeployTarget, DeploymentSource, Manifest, ResourceState,
};
use pipedk8s_diff::{diff_list, DiffOptions, DiffRenderOptions, DIFF_HEADER};
use pipedk8s_store::resource_state;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::executor::Deployer;
use crate::stages::live_resources;

const MAX_CHANGED_MANIFESTS_IN_REASON: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivestateReport {
    pub resources: Vec<ResourceState>,
    pub sync_state: ApplicationSyncState,
}

fn drift_ignored(m: &Manifest) -> bool { m.annotation(labels::IGNORE_DRIFT_DETECTION) == Some(labels::TRUE) }

/// Compare live objects against the desired manifests. When `watching` is
/// known, desired manifests of kinds nobody watches are left out.
pub fn calculate_sync_state(
    live: &[Manifest],
    desired: &[Manifest],
    watching: Option<&BTreeSet<String>>,
    commit: &str,
) -> ApplicationSyncState {
    let desired: Vec<Manifest> = desired
        .iter()
        .filter(|m| watching.map_or(true, |w| w.contains(&m.key().group_kind())))
        .filter(|m| !drift_ignored(m))
        .cloned()
        .collect();
    let live: Vec<Manifest> = live.iter().filter(|m| !drift_ignored(m)).cloned().collect();

    let opts = DiffOptions::default().with_equate_empty().with_ignore_adding_map_keys().with_compare_number_and_numeric_string();
    let result = diff_list(&live, &desired, &opts);
    if result.no_changes() {
        return ApplicationSyncState {
            status: ApplicationSyncStatus::Synced,
            short_reason: String::new(),
            reason: String::new(),
            timestamp: Utc::now(),
        };
    }

    let short_reason = format!(
        "There are {} manifests not synced ({} adds, {} deletes, {} changes)",
        result.total_out_of_sync(),
        result.adds.len(),
        result.deletes.len(),
        result.changes.len()
    );
    let rendered = result.render(&DiffRenderOptions {
        mask_secret: true,
        mask_config_map: true,
        max_changed_manifests: MAX_CHANGED_MANIFESTS_IN_REASON,
        use_diff_command: false,
    });
    let short_commit = commit.get(..7).unwrap_or(commit);
    let reason = format!(
        "Diff between the defined state in Git at commit {} and actual state in cluster:\n\n{}\n{}",
        short_commit, DIFF_HEADER, rendered
    );
    ApplicationSyncState { status: ApplicationSyncStatus::OutOfSync, short_reason, reason, timestamp: Utc::now() }
}

impl Deployer {
    /// Live resources plus sync state across `targets`; the application is
    /// out of sync when any target is.
    pub async fn get_livestate(
        &self,
        app_id: &str,
        app_name: &str,
        source: &DeploymentSource,
        targets: &[DeployTarget],
    ) -> Result<LivestateReport> {
        if targets.is_empty() {
            bail!("no deploy target given for application {}", app_id);
        }
        let mut resources = Vec::new();
        let mut drifted: Vec<ApplicationSyncState> = Vec::new();
        for target in targets {
            let (states, sync) = self.target_livestate(app_id, app_name, source, target).await?;
            resources.extend(states);
            if sync.status == ApplicationSyncStatus::OutOfSync {
                drifted.push(sync);
            }
        }
        let sync_state = match drifted.len() {
            0 => ApplicationSyncState {
                status: ApplicationSyncStatus::Synced,
                short_reason: String::new(),
                reason: String::new(),
                timestamp: Utc::now(),
            },
            1 => drifted.remove(0),
            _ => ApplicationSyncState {
                status: ApplicationSyncStatus::OutOfSync,
                short_reason: drifted.iter().map(|s| s.short_reason.as_str()).collect::<Vec<_>>().join("; "),
                reason: drifted.iter().map(|s| s.reason.as_str()).collect::<Vec<_>>().join("\n"),
                timestamp: Utc::now(),
            },
        };
        Ok(LivestateReport { resources, sync_state })
    }

    async fn target_livestate(
        &self,
        app_id: &str,
        app_name: &str,
        source: &DeploymentSource,
        target: &DeployTarget,
    ) -> Result<(Vec<ResourceState>, ApplicationSyncState)> {
        let (live, states, watching) = match self.stores.get(&target.name) {
            Some(store) => (store.managed_resources(app_id), store.livestate(app_id), store.watching_kinds()),
            None => {
                debug!(target = %target.name, app_id, "no live-state store; listing with kubectl");
                let applier = self.applier_for(&source.application_config.spec, target).await?;
                let (mut live, cluster_scoped) = live_resources(&applier, &labels::application_selector(app_id)).await?;
                live.extend(cluster_scoped);
                let now = Utc::now();
                let states = live.iter().map(|m| resource_state(m, &target.name, now)).collect();
                (live, states, None)
            }
        };
        let desired = self.load_manifests(source, app_name, target).await?;
        let sync = calculate_sync_state(&live, &desired, watching.as_deref(), &source.commit_hash);
        Ok((states, sync))
    }
}
