//! piped-k8s core: manifest model, configuration and deployment types

#![forbid(unsafe_code)]

pub mod config;
pub mod labels;
pub mod logpersister;
pub mod manifest;
pub mod model;
pub mod tool;

pub use config::{ApplicationConfig, ConfigError, KubernetesApplicationSpec};
pub use logpersister::{BufferLogPersister, StageLogPersister, TracingLogPersister};
pub use manifest::{parse_manifests, Manifest, ManifestError, ResourceKey, DEFAULT_NAMESPACE};
pub use model::*;
pub use tool::{LocalToolRegistry, ToolRegistry, Tools};

pub mod prelude {
    pub use super::{Manifest, ResourceKey, StageLogPersister, StageStatus};
}
