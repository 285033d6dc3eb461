//! Labels and annotations written on everything the plugin applies.

use std::collections::{BTreeMap, BTreeSet};

use pipedk8s_core::config::K8sResourceReference;
use pipedk8s_core::{labels, Manifest, ManifestError};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::variant::find_workloads;

/// Who applied a manifest set, and from which commit.
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub piped_id: &'a str,
    pub app_id: &'a str,
    pub commit: &'a str,
}

/// Tag every manifest with the ownership labels/annotations and the variant.
pub fn add_builtin_annotations(
    manifests: &mut [Manifest],
    variant_key: &str,
    variant: &str,
    p: Provenance<'_>,
) -> Result<(), ManifestError> {
    for m in manifests.iter_mut() {
        let api_version = m.api_version().to_string();
        let resource_key = m.key().to_string();
        let owned = [
            (labels::MANAGED_BY, labels::MANAGED_BY_PIPED),
            (labels::PIPED, p.piped_id),
            (labels::APPLICATION, p.app_id),
            (labels::COMMIT_HASH, p.commit),
        ];
        m.add_labels(owned)?;
        m.add_annotations(owned)?;
        m.add_annotations([
            (labels::ORIGINAL_API_VERSION, api_version.as_str()),
            (labels::RESOURCE_KEY, resource_key.as_str()),
        ])?;
        add_variant_label(m, variant_key, variant)?;
    }
    Ok(())
}

pub fn add_variant_label(m: &mut Manifest, variant_key: &str, variant: &str) -> Result<(), ManifestError> {
    m.add_labels([(variant_key, variant)])?;
    m.add_annotations([(variant_key, variant)])
}

/// Put the variant into the workload's selector and pod template labels.
pub fn ensure_variant_selector_in_workload(m: &mut Manifest, variant_key: &str, variant: &str) -> Result<(), ManifestError> {
    m.add_string_map_values([(variant_key, variant)], &["spec", "selector", "matchLabels"])?;
    m.add_string_map_values([(variant_key, variant)], &["spec", "template", "metadata", "labels"])
}

/// Names of the ConfigMaps and Secrets a pod spec refers to.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigRefs {
    pub config_maps: BTreeSet<String>,
    pub secrets: BTreeSet<String>,
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, k| cur.get(*k))?.as_str()
}

fn items<'a>(v: &'a Json, key: &str) -> impl Iterator<Item = &'a Json> {
    v.get(key).and_then(|a| a.as_array()).into_iter().flatten()
}

pub fn referenced_configs(pod_spec: &Json) -> ConfigRefs {
    let mut refs = ConfigRefs::default();
    let mut cm = |name: Option<&str>| {
        if let Some(n) = name {
            refs.config_maps.insert(n.to_string());
        }
    };
    for vol in items(pod_spec, "volumes") {
        cm(str_at(vol, &["configMap", "name"]));
        for src in vol.get("projected").map(|p| items(p, "sources")).into_iter().flatten() {
            cm(str_at(src, &["configMap", "name"]));
        }
    }
    for c in items(pod_spec, "containers").chain(items(pod_spec, "initContainers")) {
        for env in items(c, "env") {
            cm(str_at(env, &["valueFrom", "configMapKeyRef", "name"]));
        }
        for env in items(c, "envFrom") {
            cm(str_at(env, &["configMapRef", "name"]));
        }
    }

    let mut secret = |name: Option<&str>| {
        if let Some(n) = name {
            refs.secrets.insert(n.to_string());
        }
    };
    for vol in items(pod_spec, "volumes") {
        secret(str_at(vol, &["secret", "secretName"]));
        for src in vol.get("projected").map(|p| items(p, "sources")).into_iter().flatten() {
            secret(str_at(src, &["secret", "name"]));
        }
    }
    for c in items(pod_spec, "containers").chain(items(pod_spec, "initContainers")) {
        for env in items(c, "env") {
            secret(str_at(env, &["valueFrom", "secretKeyRef", "name"]));
        }
        for env in items(c, "envFrom") {
            secret(str_at(env, &["secretRef", "name"]));
        }
    }
    refs
}

/// Payload fields of a ConfigMap or Secret; metadata never counts.
const CONFIG_PAYLOAD: [&str; 3] = ["data", "binaryData", "stringData"];

fn config_payload(m: &Manifest) -> String {
    let payload: serde_json::Map<String, Json> = CONFIG_PAYLOAD
        .iter()
        .filter_map(|f| m.body().get(*f).map(|v| (f.to_string(), v.clone())))
        .collect();
    Json::Object(payload).to_string()
}

/// Hex sha256 over the payload of the referenced objects, independent of
/// their order. `None` when nothing referenced is part of `manifests`.
pub fn config_hash(refs: &ConfigRefs, manifests: &[Manifest]) -> Option<String> {
    let mut matched: BTreeMap<(String, String), String> = BTreeMap::new();
    for m in manifests {
        let wanted = (m.is_config_map() && refs.config_maps.contains(m.name()))
            || (m.is_secret() && refs.secrets.contains(m.name()));
        if wanted {
            matched.insert((m.kind().to_string(), m.name().to_string()), config_payload(m));
        }
    }
    if matched.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    for ((kind, name), body) in &matched {
        hasher.update(kind.as_bytes());
        hasher.update(b"/");
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
        hasher.update(body.as_bytes());
        hasher.update(b"\n");
    }
    Some(hex::encode(hasher.finalize()))
}

/// Write the config hash of each workload into its pod template, so a
/// config change rolls the pods.
pub fn annotate_config_hash(manifests: &mut [Manifest], workload_refs: &[K8sResourceReference]) -> Result<(), ManifestError> {
    let workload_keys: BTreeSet<_> = find_workloads(manifests, workload_refs).iter().map(|m| m.key()).collect();
    let hashes: Vec<(usize, String)> = manifests
        .iter()
        .enumerate()
        .filter(|(_, m)| workload_keys.contains(&m.key()))
        .filter_map(|(i, m)| {
            let pod_spec = m.nested(&["spec", "template", "spec"])?;
            config_hash(&referenced_configs(pod_spec), manifests).map(|h| (i, h))
        })
        .collect();
    for (i, hash) in hashes {
        manifests[i].add_string_map_values([(labels::CONFIG_HASH, hash.as_str())], &["spec", "template", "metadata", "annotations"])?;
    }
    Ok(())
}
