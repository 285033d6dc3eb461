//! Selecting workloads/services and generating variant copies of them.

use std::collections::BTreeMap;

use pipedk8s_core::config::K8sResourceReference;
use pipedk8s_core::{Manifest, ManifestError, ResourceKey};
use serde_json::Value as Json;

use crate::provenance::{add_variant_label, ensure_variant_selector_in_workload};

const DEFAULT_WORKLOAD_KIND: &str = "Deployment";
const DEFAULT_SERVICE_KIND: &str = "Service";

/// Manifests of `kind`, all of them when `name` is empty.
pub fn find_manifests<'a>(manifests: &'a [Manifest], kind: &str, name: &str) -> Vec<&'a Manifest> {
    manifests.iter().filter(|m| m.kind() == kind && (name.is_empty() || m.name() == name)).collect()
}

/// Workloads selected by `refs`; every Deployment when no refs are configured.
pub fn find_workloads<'a>(manifests: &'a [Manifest], refs: &[K8sResourceReference]) -> Vec<&'a Manifest> {
    if refs.is_empty() {
        return find_manifests(manifests, DEFAULT_WORKLOAD_KIND, "");
    }
    let mut out: Vec<&Manifest> = Vec::new();
    for r in refs {
        for m in find_manifests(manifests, r.kind_or(DEFAULT_WORKLOAD_KIND), &r.name) {
            if !out.iter().any(|o| std::ptr::eq(*o, m)) {
                out.push(m);
            }
        }
    }
    out
}

pub fn find_services<'a>(manifests: &'a [Manifest], service: &K8sResourceReference) -> Vec<&'a Manifest> {
    find_manifests(manifests, service.kind_or(DEFAULT_SERVICE_KIND), &service.name)
}

/// ConfigMaps and Secrets keyed by normalized resource key.
pub fn find_configs_and_secrets(manifests: &[Manifest]) -> BTreeMap<ResourceKey, &Manifest> {
    manifests.iter().filter(|m| m.is_config_map() || m.is_secret()).map(|m| (m.key().normalize(), m)).collect()
}

pub fn suffixed_name(name: &str, suffix: &str) -> String {
    if suffix.is_empty() { name.to_string() } else { format!("{}-{}", name, suffix) }
}

pub fn replicas_of(m: &Manifest) -> Option<u32> {
    m.nested(&["spec", "replicas"]).and_then(|v| v.as_u64()).map(|n| n as u32)
}

/// Copies of `workloads` renamed with `suffix`, selecting only pods of
/// `variant`, scaled by `replicas(current)`.
pub fn generate_variant_workloads<F>(
    workloads: &[&Manifest],
    variant_key: &str,
    variant: &str,
    suffix: &str,
    replicas: F,
) -> Result<Vec<Manifest>, ManifestError>
where
    F: Fn(Option<u32>) -> u32,
{
    let mut out = Vec::with_capacity(workloads.len());
    for w in workloads {
        let mut m = (*w).clone();
        m.set_name(&suffixed_name(w.name(), suffix))?;
        ensure_variant_selector_in_workload(&mut m, variant_key, variant)?;
        m.set_nested(&["spec", "replicas"], Json::from(replicas(replicas_of(w))))?;
        add_variant_label(&mut m, variant_key, variant)?;
        out.push(m);
    }
    Ok(out)
}

/// ClusterIP copies of `services` renamed with `suffix` that only route to
/// pods of `variant`.
pub fn generate_variant_services(
    services: &[&Manifest],
    variant_key: &str,
    variant: &str,
    suffix: &str,
) -> Result<Vec<Manifest>, ManifestError> {
    let mut out = Vec::with_capacity(services.len());
    for s in services {
        let mut m = (*s).clone();
        m.set_name(&suffixed_name(s.name(), suffix))?;
        m.set_nested(&["spec", "type"], Json::String("ClusterIP".to_string()))?;
        m.add_string_map_values([(variant_key, variant)], &["spec", "selector"])?;
        for field in ["externalIPs", "loadBalancerIP", "loadBalancerSourceRanges", "clusterIP", "clusterIPs"] {
            m.remove_nested(&["spec", field]);
        }
        if let Some(ports) = m.nested_mut(&["spec", "ports"]).and_then(|p| p.as_array_mut()) {
            for port in ports.iter_mut().filter_map(|p| p.as_object_mut()) {
                port.remove("nodePort");
            }
        }
        add_variant_label(&mut m, variant_key, variant)?;
        out.push(m);
    }
    Ok(out)
}
