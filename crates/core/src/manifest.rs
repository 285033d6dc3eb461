//! Unstructured Kubernetes manifests and their identity.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("parsing YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("converting manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest is not a mapping")]
    NotAnObject,
    #[error("YAML missing apiVersion")]
    MissingApiVersion,
    #[error("YAML missing kind")]
    MissingKind,
    #[error("YAML missing metadata.name")]
    MissingName,
    #[error("YAML payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("YAML document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("invalid resource key {0:?}")]
    InvalidKey(String),
    #[error("{0} is not a mapping")]
    NotAMap(String),
}

fn max_manifest_bytes() -> usize {
    std::env::var("PIPED_K8S_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(32 * 1024 * 1024)
}

fn max_manifest_nodes() -> usize {
    std::env::var("PIPED_K8S_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Identity of a resource inside one cluster.
///
/// The string form is `<apiGroup>:<kind>:<namespace>:<name>` and is what gets
/// written into the `pipecd.dev/resource-key` annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    group: String,
    kind: String,
    namespace: String,
    name: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn group(&self) -> &str { &self.group }
    pub fn kind(&self) -> &str { &self.kind }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }

    /// Same key with an empty namespace replaced by `default`.
    pub fn normalize(&self) -> Self {
        let mut k = self.clone();
        if k.namespace.is_empty() {
            k.namespace = DEFAULT_NAMESPACE.to_string();
        }
        k
    }

    pub fn normalized_eq(&self, other: &ResourceKey) -> bool {
        self.normalize() == other.normalize()
    }

    /// `Kind.group` form accepted by `kubectl get/delete`.
    pub fn group_kind(&self) -> String {
        if self.group.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, self.group) }
    }

    pub fn is_secret(&self) -> bool { self.group.is_empty() && self.kind == "Secret" }
    pub fn is_config_map(&self) -> bool { self.group.is_empty() && self.kind == "ConfigMap" }
    pub fn is_service(&self) -> bool { self.group.is_empty() && self.kind == "Service" }
    pub fn is_deployment(&self) -> bool { self.group == "apps" && self.kind == "Deployment" }

    pub fn readable_string(&self) -> String {
        format!(
            "name={:?}, kind={:?}, namespace={:?}, apiGroup={:?}",
            self.name, self.kind, self.namespace, self.group
        )
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.group, self.kind, self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        match parts.as_slice() {
            [group, kind, namespace, name] if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(*group, *kind, *namespace, *name))
            }
            _ => Err(ManifestError::InvalidKey(s.to_string())),
        }
    }
}

/// An unstructured Kubernetes object.
///
/// Cloning yields an independent deep copy; handlers clone before mutating
/// anything handed out by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub struct Manifest {
    body: Json,
}

impl TryFrom<Json> for Manifest {
    type Error = ManifestError;
    fn try_from(v: Json) -> Result<Self, Self::Error> { Manifest::from_json(v) }
}

impl From<Manifest> for Json {
    fn from(m: Manifest) -> Self { m.body }
}

impl Manifest {
    pub fn from_json(body: Json) -> Result<Self, ManifestError> {
        if !body.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let api_version = body.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        if api_version.is_empty() {
            return Err(ManifestError::MissingApiVersion);
        }
        let kind = body.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if kind.is_empty() {
            return Err(ManifestError::MissingKind);
        }
        let name = body.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
        if name.is_empty() {
            return Err(ManifestError::MissingName);
        }
        Ok(Self { body })
    }

    pub fn from_typed<T: Serialize>(obj: &T) -> Result<Self, ManifestError> {
        Self::from_json(serde_json::to_value(obj)?)
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, ManifestError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn body(&self) -> &Json { &self.body }
    pub fn into_body(self) -> Json { self.body }

    pub fn api_version(&self) -> &str { self.body.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("") }
    pub fn kind(&self) -> &str { self.body.get("kind").and_then(|v| v.as_str()).unwrap_or("") }
    pub fn name(&self) -> &str { self.nested_str(&["metadata", "name"]).unwrap_or("") }
    pub fn namespace(&self) -> &str { self.nested_str(&["metadata", "namespace"]).unwrap_or("") }
    pub fn uid(&self) -> &str { self.nested_str(&["metadata", "uid"]).unwrap_or("") }

    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.group(), self.kind(), self.namespace(), self.name())
    }

    pub fn is_secret(&self) -> bool { self.key().is_secret() }
    pub fn is_config_map(&self) -> bool { self.key().is_config_map() }
    pub fn is_service(&self) -> bool { self.key().is_service() }
    pub fn is_deployment(&self) -> bool { self.key().is_deployment() }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.nested(&["metadata", "labels", key]).and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.nested(&["metadata", "annotations", key]).and_then(|v| v.as_str())
    }

    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map(&["metadata", "labels"]) }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map(&["metadata", "annotations"]) }

    pub fn string_map(&self, path: &[&str]) -> BTreeMap<String, String> {
        self.nested(path)
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    pub fn owner_uids(&self) -> Vec<&str> {
        self.nested(&["metadata", "ownerReferences"])
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| r.get("uid").and_then(|u| u.as_str())).collect())
            .unwrap_or_default()
    }

    pub fn nested(&self, path: &[&str]) -> Option<&Json> {
        let mut cur = &self.body;
        for p in path {
            cur = cur.as_object()?.get(*p)?;
        }
        Some(cur)
    }

    pub fn nested_str(&self, path: &[&str]) -> Option<&str> {
        self.nested(path).and_then(|v| v.as_str())
    }

    pub fn nested_mut(&mut self, path: &[&str]) -> Option<&mut Json> {
        let mut cur = &mut self.body;
        for p in path {
            cur = cur.as_object_mut()?.get_mut(*p)?;
        }
        Some(cur)
    }

    /// Walk `path`, creating empty mappings for missing segments.
    fn ensure_map(&mut self, path: &[&str]) -> Result<&mut Map<String, Json>, ManifestError> {
        let mut cur = &mut self.body;
        for (i, p) in path.iter().enumerate() {
            let obj = cur.as_object_mut().ok_or_else(|| ManifestError::NotAMap(path[..i].join(".")))?;
            let next = obj.entry(p.to_string()).or_insert_with(|| Json::Object(Map::new()));
            if next.is_null() {
                *next = Json::Object(Map::new());
            }
            cur = next;
        }
        cur.as_object_mut().ok_or_else(|| ManifestError::NotAMap(path.join(".")))
    }

    pub fn set_nested(&mut self, path: &[&str], value: Json) -> Result<(), ManifestError> {
        let Some((last, parents)) = path.split_last() else { return Ok(()) };
        self.ensure_map(parents)?.insert(last.to_string(), value);
        Ok(())
    }

    pub fn remove_nested(&mut self, path: &[&str]) -> Option<Json> {
        let (last, parents) = path.split_last()?;
        self.nested_mut(parents)?.as_object_mut()?.remove(*last)
    }

    /// Merge string pairs into the mapping at `path`, creating it if absent.
    pub fn add_string_map_values<'a, I>(&mut self, values: I, path: &[&str]) -> Result<(), ManifestError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let map = self.ensure_map(path)?;
        for (k, v) in values {
            map.insert(k.to_string(), Json::String(v.to_string()));
        }
        Ok(())
    }

    pub fn add_labels<'a, I>(&mut self, labels: I) -> Result<(), ManifestError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.add_string_map_values(labels, &["metadata", "labels"])
    }

    pub fn add_annotations<'a, I>(&mut self, annotations: I) -> Result<(), ManifestError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.add_string_map_values(annotations, &["metadata", "annotations"])
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), ManifestError> {
        self.set_nested(&["metadata", "name"], Json::String(name.to_string()))
    }

    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), ManifestError> {
        self.set_nested(&["metadata", "namespace"], Json::String(namespace.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(&self.body)?)
    }
}

/// Parse a multi-document YAML stream into manifests.
///
/// Empty documents are skipped and `kind: *List` documents are expanded into
/// their items.
pub fn parse_manifests(data: &str) -> Result<Vec<Manifest>, ManifestError> {
    let max_bytes = max_manifest_bytes();
    if data.len() > max_bytes {
        return Err(ManifestError::TooLarge(max_bytes));
    }
    let max_nodes = max_manifest_nodes();
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(data) {
        let val = serde_yaml::Value::deserialize(doc)?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)?;
        if json.as_object().map(|m| m.is_empty()).unwrap_or(false) {
            continue;
        }
        if node_budget_exceeded(&json, max_nodes) {
            return Err(ManifestError::TooComplex(max_nodes));
        }
        push_document(json, &mut out)?;
    }
    Ok(out)
}

fn push_document(json: Json, out: &mut Vec<Manifest>) -> Result<(), ManifestError> {
    let is_list = json.get("kind").and_then(|k| k.as_str()).map(|k| k.ends_with("List")).unwrap_or(false);
    if is_list {
        if let Some(items) = json.get("items").and_then(|i| i.as_array()) {
            for item in items {
                out.push(Manifest::from_json(item.clone())?);
            }
            return Ok(());
        }
    }
    out.push(Manifest::from_json(json)?);
    Ok(())
}
