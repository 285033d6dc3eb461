//! piped-k8s apply: kubectl capability, in-memory cluster and the applier

#![forbid(unsafe_code)]

mod applier;
mod kubectl;
mod memory;

pub use applier::{apply_manifests, Applier, ApplyPolicy};
pub use kubectl::{KubectlCli, KubectlError, KubectlOps, KubectlResult};
pub use memory::{is_cluster_scoped_kind, InMemoryKubectl};
