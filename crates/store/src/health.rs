//! Health of live resources.

use k8s_openapi::api::apps::v1::Deployment;
use pipedk8s_core::{Manifest, ResourceHealthStatus};

/// Health and a human description; kinds without rules are `Unknown`.
pub fn determine_health(m: &Manifest) -> (ResourceHealthStatus, String) {
    if !m.is_deployment() {
        return (ResourceHealthStatus::Unknown, String::new());
    }
    match m.to_typed::<Deployment>() {
        Ok(d) => deployment_health(&d),
        Err(e) => (ResourceHealthStatus::Unknown, format!("Unexpected error while decoding deployment: {}", e)),
    }
}

/// Mirrors `kubectl rollout status` for Deployments.
pub fn deployment_health(d: &Deployment) -> (ResourceHealthStatus, String) {
    let unhealthy = |desc: String| (ResourceHealthStatus::Unhealthy, desc);
    let name = d.metadata.name.as_deref().unwrap_or_default();
    let spec = d.spec.as_ref();
    let status = d.status.clone().unwrap_or_default();

    if spec.and_then(|s| s.paused).unwrap_or(false) {
        return unhealthy("Deployment is paused".to_string());
    }
    let generation = d.metadata.generation.unwrap_or(0);
    if generation > status.observed_generation.unwrap_or(0) {
        return unhealthy(
            "Waiting for rollout to finish because observed deployment generation less than desired generation".to_string(),
        );
    }
    let deadline_exceeded = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
    if deadline_exceeded {
        return unhealthy(format!("Deployment {:?} exceeded its progress deadline", name));
    }
    let Some(desired) = spec.and_then(|s| s.replicas) else {
        return unhealthy("The number of desired replicas is unspecified".to_string());
    };
    let updated = status.updated_replicas.unwrap_or(0);
    let replicas = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated < desired {
        return unhealthy(format!("Waiting for remaining {}/{} replicas to be updated", updated, desired));
    }
    if updated < replicas {
        return unhealthy(format!("Waiting for remaining {}/{} old replicas to be terminated", replicas - updated, replicas));
    }
    if available < replicas {
        return unhealthy(format!("Waiting for remaining {}/{} replicas to be available", replicas - available, replicas));
    }
    (ResourceHealthStatus::Healthy, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(spec: serde_json::Value, status: serde_json::Value) -> Manifest {
        Manifest::from_json(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "simple", "generation": 2},
            "spec": spec,
            "status": status,
        }))
        .unwrap()
    }

    fn selector() -> serde_json::Value {
        serde_json::json!({"matchLabels": {"app": "simple"}})
    }

    fn template() -> serde_json::Value {
        serde_json::json!({"metadata": {"labels": {"app": "simple"}}, "spec": {"containers": [{"name": "c", "image": "nginx"}]}})
    }

    #[test]
    fn rolled_out_deployment_is_healthy() {
        let m = deployment(
            serde_json::json!({"replicas": 2, "selector": selector(), "template": template()}),
            serde_json::json!({"observedGeneration": 2, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}),
        );
        assert_eq!(determine_health(&m), (ResourceHealthStatus::Healthy, String::new()));
    }

    #[test]
    fn rollout_in_progress_is_unhealthy() {
        let m = deployment(
            serde_json::json!({"replicas": 3, "selector": selector(), "template": template()}),
            serde_json::json!({"observedGeneration": 2, "replicas": 3, "updatedReplicas": 1, "availableReplicas": 1}),
        );
        let (status, desc) = determine_health(&m);
        assert_eq!(status, ResourceHealthStatus::Unhealthy);
        assert_eq!(desc, "Waiting for remaining 1/3 replicas to be updated");

        let stale = deployment(
            serde_json::json!({"replicas": 3, "selector": selector(), "template": template()}),
            serde_json::json!({"observedGeneration": 1}),
        );
        assert!(determine_health(&stale).1.starts_with("Waiting for rollout to finish"));

        let paused = deployment(
            serde_json::json!({"paused": true, "selector": selector(), "template": template()}),
            serde_json::json!({}),
        );
        assert_eq!(determine_health(&paused).1, "Deployment is paused");
    }

    #[test]
    fn other_kinds_are_unknown() {
        let svc = Manifest::from_json(serde_json::json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}})).unwrap();
        assert_eq!(determine_health(&svc).0, ResourceHealthStatus::Unknown);
    }
}
