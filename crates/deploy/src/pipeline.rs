//! Stage lists for quick sync and pipeline sync.

use std::collections::BTreeMap;

use pipedk8s_core::{ManualOperation, PipelineStage, QuickSyncStage, StageConfig};

use crate::stage::StageName;

/// `K8S_SYNC`, followed by `K8S_ROLLBACK` when auto rollback is on.
pub fn build_quick_sync_stages(auto_rollback: bool) -> Vec<QuickSyncStage> {
    let mut out = vec![QuickSyncStage {
        name: StageName::Sync.as_str().to_string(),
        description: StageName::Sync.description().to_string(),
        rollback: false,
        metadata: BTreeMap::new(),
        available_operation: ManualOperation::None,
    }];
    if auto_rollback {
        out.push(QuickSyncStage {
            name: StageName::Rollback.as_str().to_string(),
            description: StageName::Rollback.description().to_string(),
            rollback: true,
            metadata: BTreeMap::new(),
            available_operation: ManualOperation::None,
        });
    }
    out
}

/// The configured stages with their indices; with auto rollback a
/// `K8S_ROLLBACK` stage is appended at the smallest configured index.
pub fn build_pipeline_stages(stages: &[StageConfig], auto_rollback: bool) -> Vec<PipelineStage> {
    let mut out: Vec<PipelineStage> =
        stages.iter().map(|s| PipelineStage { index: s.index, name: s.name.clone(), rollback: false }).collect();
    if auto_rollback {
        let index = stages.iter().map(|s| s.index).min().unwrap_or(0);
        out.push(PipelineStage { index, name: StageName::Rollback.as_str().to_string(), rollback: true });
    }
    out
}
