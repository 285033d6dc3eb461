//! piped-k8s deploy: strategy, stage execution, drift and plan preview

#![forbid(unsafe_code)]

pub mod determiner;
mod executor;
mod livestate;
pub mod pipeline;
mod plan;
pub mod provenance;
pub mod prune;
mod resolver;
pub mod stage;
mod stages;
pub mod variant;

pub use determiner::{determine_strategy, determine_versions, parse_container_image, ContainerImage};
pub use executor::{prune_wait_from_env, Deployer, StageRequest, DEFAULT_PRUNE_WAIT};
pub use livestate::{calculate_sync_state, LivestateReport};
pub use pipeline::{build_pipeline_stages, build_quick_sync_stages};
pub use plan::{PlanPreviewResult, StrategyDecision};
pub use resolver::{FixedKubectl, KubectlResolver, ToolKubectlResolver};
pub use stage::{StageName, UnknownStage};
