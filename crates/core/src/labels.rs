//! Label and annotation keys written to or read from cluster objects.

pub const MANAGED_BY: &str = "pipecd.dev/managed-by";
pub const PIPED: &str = "pipecd.dev/piped";
pub const APPLICATION: &str = "pipecd.dev/application";
pub const COMMIT_HASH: &str = "pipecd.dev/commit-hash";
pub const ORIGINAL_API_VERSION: &str = "pipecd.dev/original-api-version";
pub const RESOURCE_KEY: &str = "pipecd.dev/resource-key";
pub const CONFIG_HASH: &str = "pipecd.dev/config-hash";

pub const SYNC_BY_REPLACE: &str = "pipecd.dev/sync-by-replace";
pub const FORCE_SYNC_BY_REPLACE: &str = "pipecd.dev/force-sync-by-replace";
pub const SERVER_SIDE_APPLY: &str = "pipecd.dev/server-side-apply";
pub const IGNORE_DRIFT_DETECTION: &str = "pipecd.dev/ignore-drift-detection";
pub const ORDER: &str = "pipecd.dev/order";

/// Value of `MANAGED_BY` on everything the agent creates.
pub const MANAGED_BY_PIPED: &str = "piped";

pub const ENABLED: &str = "enabled";
pub const TRUE: &str = "true";

pub const DEFAULT_VARIANT_LABEL: &str = "pipecd.dev/variant";
pub const DEFAULT_PRIMARY_VARIANT: &str = "primary";
pub const DEFAULT_CANARY_VARIANT: &str = "canary";
pub const DEFAULT_BASELINE_VARIANT: &str = "baseline";

/// Label selector matching everything one application owns.
pub fn application_selector(app_id: &str) -> Vec<String> {
    vec![format!("{}={}", MANAGED_BY, MANAGED_BY_PIPED), format!("{}={}", APPLICATION, app_id)]
}
