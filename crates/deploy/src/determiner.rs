//! Quick sync or pipeline: decided by what changed between two manifest sets.

use pipedk8s_core::config::K8sResourceReference;
use pipedk8s_core::{ArtifactKind, ArtifactVersion, Manifest, SyncStrategy};
use pipedk8s_diff::{diff, DiffOptions, Nodes};
use regex::Regex;
use tracing::debug;

use crate::variant::{find_configs_and_secrets, find_workloads};

fn determiner_options() -> DiffOptions {
    DiffOptions::default().with_equate_empty().with_ignore_adding_map_keys().with_compare_number_and_numeric_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub name: String,
    pub tag: String,
}

/// `registry/path/name:tag` split into its last path segment and tag.
pub fn parse_container_image(image: &str) -> ContainerImage {
    let (path, tag) = match image.rsplit_once(':') {
        Some((p, t)) if !t.contains('/') => (p, t),
        _ => (image, ""),
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    ContainerImage { name: name.to_string(), tag: tag.to_string() }
}

fn image_change_summary(template_diffs: &Nodes) -> Option<String> {
    let re = Regex::new(r"^spec\.template\.spec\.(init)?[cC]ontainers\.\d+\.image$").ok()?;
    let nodes = template_diffs.find(&re);
    if nodes.is_empty() {
        return None;
    }
    let images: Vec<String> = nodes
        .iter()
        .map(|n| {
            let before = parse_container_image(&n.string_x());
            let after = parse_container_image(&n.string_y());
            if before.name == after.name {
                format!("image {} from {} to {}", before.name, before.tag, after.tag)
            } else {
                format!("image {}:{} to {}:{}", before.name, before.tag, after.name, after.tag)
            }
        })
        .collect();
    Some(format!("Sync progressively because of updating {}", images.join(", ")))
}

/// Pick a strategy and say why.
pub fn determine_strategy(olds: &[Manifest], news: &[Manifest], workload_refs: &[K8sResourceReference]) -> (SyncStrategy, String) {
    let old_workloads = find_workloads(olds, workload_refs);
    if old_workloads.is_empty() {
        return (
            SyncStrategy::QuickSync,
            "Quick sync by applying all manifests because it was unable to find the currently running workloads".to_string(),
        );
    }
    let new_workloads = find_workloads(news, workload_refs);
    if new_workloads.is_empty() {
        return (
            SyncStrategy::QuickSync,
            "Quick sync by applying all manifests because it was unable to find workloads in the new manifests".to_string(),
        );
    }

    let opts = determiner_options();
    let mut workload_diffs: Vec<(&Manifest, Nodes)> = Vec::new();
    for new in &new_workloads {
        let key = new.key().normalize();
        let Some(old) = old_workloads.iter().find(|o| o.key().normalize() == key) else {
            continue;
        };
        let nodes = diff(old, new, &opts);
        let template = Nodes::new(nodes.find_by_prefix("spec.template").into_iter().cloned().collect());
        if template.has_diff() {
            if let Some(summary) = image_change_summary(&template) {
                return (SyncStrategy::Pipeline, summary);
            }
            return (
                SyncStrategy::Pipeline,
                format!("Sync progressively because pod template of workload {} was changed", new.name()),
            );
        }
        workload_diffs.push((new, nodes));
    }

    let old_configs = find_configs_and_secrets(olds);
    let new_configs = find_configs_and_secrets(news);
    if old_configs.len() > new_configs.len() {
        return (
            SyncStrategy::Pipeline,
            format!("Sync progressively because {} configmap/secret deleted", old_configs.len() - new_configs.len()),
        );
    }
    if old_configs.len() < new_configs.len() {
        return (
            SyncStrategy::Pipeline,
            format!("Sync progressively because new {} configmap/secret added", new_configs.len() - old_configs.len()),
        );
    }
    for (key, old) in &old_configs {
        let Some(new) = new_configs.get(key) else {
            return (SyncStrategy::Pipeline, format!("Sync progressively because {} {} was deleted", old.kind(), old.name()));
        };
        if diff(old, new, &opts).has_diff() {
            return (SyncStrategy::Pipeline, format!("Sync progressively because {} {} was updated", old.kind(), old.name()));
        }
    }

    let re = Regex::new(r"^spec\.replicas$").ok();
    let mut scales: Vec<String> = workload_diffs
        .iter()
        .filter_map(|(m, nodes)| {
            let node = nodes.find(re.as_ref()?).into_iter().next()?;
            Some(format!("{}/{} from {} to {}", m.kind(), m.name(), node.string_x(), node.string_y()))
        })
        .collect();
    scales.sort();
    if !scales.is_empty() {
        debug!(scales = scales.len(), "scaling-only change");
        return (SyncStrategy::QuickSync, format!("Quick sync to scale {}", scales.join(", ")));
    }
    (SyncStrategy::QuickSync, "Quick sync by applying all manifests".to_string())
}

/// Container images of the workloads, de-duplicated, in manifest order.
pub fn determine_versions(manifests: &[Manifest], workload_refs: &[K8sResourceReference]) -> Vec<ArtifactVersion> {
    let mut out: Vec<ArtifactVersion> = Vec::new();
    for w in find_workloads(manifests, workload_refs) {
        let containers = w.nested(&["spec", "template", "spec", "containers"]).and_then(|c| c.as_array());
        for c in containers.into_iter().flatten() {
            let Some(image) = c.get("image").and_then(|i| i.as_str()) else { continue };
            let parsed = parse_container_image(image);
            let v = ArtifactVersion {
                kind: ArtifactKind::ContainerImage,
                version: parsed.tag,
                name: parsed.name,
                url: image.to_string(),
            };
            if !out.contains(&v) {
                out.push(v);
            }
        }
    }
    out
}
