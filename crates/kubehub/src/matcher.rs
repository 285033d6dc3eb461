//! Which discovered resources the live-state store watches.

use pipedk8s_core::{AppStateInformerConfig, KubernetesResourceMatcher};

/// API versions watched when nothing is configured.
const BUILTIN_API_VERSIONS: &[&str] = &[
    "admissionregistration.k8s.io/v1",
    "apiextensions.k8s.io/v1",
    "apps/v1",
    "autoscaling/v1",
    "autoscaling/v2",
    "batch/v1",
    "networking.k8s.io/v1",
    "policy/v1",
    "rbac.authorization.k8s.io/v1",
    "storage.k8s.io/v1",
    "v1",
];

/// High-churn or cluster-owned kinds inside the builtin versions.
const BUILTIN_IGNORED: &[(&str, &str)] = &[
    ("v1", "Event"),
    ("v1", "Endpoints"),
    ("v1", "Node"),
    ("v1", "Binding"),
    ("v1", "ComponentStatus"),
    ("v1", "ReplicationController"),
    ("v1", "PodTemplate"),
    ("apps/v1", "ControllerRevision"),
    ("storage.k8s.io/v1", "CSINode"),
    ("storage.k8s.io/v1", "VolumeAttachment"),
];

#[derive(Debug, Clone, Default)]
pub struct ResourceMatcher {
    includes: Vec<KubernetesResourceMatcher>,
    excludes: Vec<KubernetesResourceMatcher>,
}

impl ResourceMatcher {
    pub fn new(cfg: &AppStateInformerConfig) -> Self {
        Self { includes: cfg.include_resources.clone(), excludes: cfg.exclude_resources.clone() }
    }

    /// Excludes win over includes; includes extend the builtin set.
    pub fn is_matched(&self, api_version: &str, kind: &str) -> bool {
        if self.excludes.iter().any(|m| matches(m, api_version, kind)) {
            return false;
        }
        if self.includes.iter().any(|m| matches(m, api_version, kind)) {
            return true;
        }
        BUILTIN_API_VERSIONS.contains(&api_version)
            && !BUILTIN_IGNORED.iter().any(|(v, k)| *v == api_version && *k == kind)
    }
}

fn matches(m: &KubernetesResourceMatcher, api_version: &str, kind: &str) -> bool {
    m.api_version == api_version && (m.kind.is_empty() || m.kind == kind)
}
