//! piped-k8s store: live-state of application resources per deploy target

#![forbid(unsafe_code)]

mod health;
mod ingest;
mod manager;
mod store;

pub use health::{deployment_health, determine_health};
pub use ingest::{queue_cap_from_env, spawn_ingest, IngestHandle, DEFAULT_QUEUE_CAP};
pub use manager::StoreManager;
pub use store::{resource_state, AppStore};
