//! In-memory cluster implementing [`KubectlOps`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipedk8s_core::{Manifest, ResourceKey, DEFAULT_NAMESPACE};
use serde_json::Value as Json;

use crate::kubectl::{KubectlError, KubectlOps, KubectlResult};

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
];

pub fn is_cluster_scoped_kind(kind: &str) -> bool { CLUSTER_SCOPED_KINDS.contains(&kind) }

/// A fake cluster: objects keyed by normalized resource key, uids assigned on
/// first write, and a log of every mutating call.
#[derive(Debug, Default)]
pub struct InMemoryKubectl {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    objects: BTreeMap<ResourceKey, Manifest>,
    ops: Vec<String>,
    next_uid: u64,
}

impl MemState {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{:04}", self.next_uid)
    }

    fn store(&mut self, namespace: &str, manifest: &Manifest) -> KubectlResult<ResourceKey> {
        let mut m = manifest.clone();
        if !is_cluster_scoped_kind(m.kind()) {
            let ns = if !namespace.is_empty() {
                namespace.to_string()
            } else if !m.namespace().is_empty() {
                m.namespace().to_string()
            } else {
                DEFAULT_NAMESPACE.to_string()
            };
            m.set_namespace(&ns)?;
        }
        let key = Self::lookup_key("", &m.key());
        let uid = match self.objects.get(&key) {
            Some(prev) if !prev.uid().is_empty() => prev.uid().to_string(),
            _ => self.uid(),
        };
        m.set_nested(&["metadata", "uid"], Json::String(uid))?;
        self.objects.insert(key.clone(), m);
        Ok(key)
    }

    fn lookup_key(namespace: &str, key: &ResourceKey) -> ResourceKey {
        if is_cluster_scoped_kind(key.kind()) {
            return ResourceKey::new(key.group(), key.kind(), "", key.name());
        }
        let ns = if !namespace.is_empty() { namespace } else { key.namespace() };
        ResourceKey::new(key.group(), key.kind(), ns, key.name()).normalize()
    }

    fn target_key(namespace: &str, manifest: &Manifest) -> ResourceKey {
        Self::lookup_key(namespace, &manifest.key())
    }
}

impl InMemoryKubectl {
    pub fn new() -> Self { Self::default() }

    /// Seed an object without recording an operation. Panics on a manifest
    /// that cannot be stored.
    pub fn insert(&self, manifest: Manifest) {
        let mut st = self.state.lock();
        st.store("", &manifest).expect("fixture manifest must be storable");
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Manifest> {
        let st = self.state.lock();
        st.objects.get(&MemState::lookup_key("", key)).cloned()
    }

    pub fn objects(&self) -> Vec<Manifest> { self.state.lock().objects.values().cloned().collect() }

    pub fn ops(&self) -> Vec<String> { self.state.lock().ops.clone() }

    pub fn clear_ops(&self) { self.state.lock().ops.clear(); }
}

fn parse_selector(selector: &[String]) -> Vec<(String, String)> {
    selector
        .iter()
        .flat_map(|s| s.split(','))
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn matches_selector(m: &Manifest, sel: &[(String, String)]) -> bool {
    sel.iter().all(|(k, v)| m.label(k) == Some(v.as_str()))
}

#[async_trait]
impl KubectlOps for InMemoryKubectl {
    async fn apply(&self, _kubeconfig: &str, namespace: &str, manifest: &Manifest, server_side: bool) -> KubectlResult<()> {
        let mut st = self.state.lock();
        let key = st.store(namespace, manifest)?;
        let op = if server_side { "apply-server-side" } else { "apply" };
        st.ops.push(format!("{} {}", op, key));
        Ok(())
    }

    async fn create(&self, _kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        let mut st = self.state.lock();
        if st.objects.contains_key(&MemState::target_key(namespace, manifest)) {
            return Err(KubectlError::AlreadyExists);
        }
        let key = st.store(namespace, manifest)?;
        st.ops.push(format!("create {}", key));
        Ok(())
    }

    async fn replace(&self, _kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        let mut st = self.state.lock();
        if !st.objects.contains_key(&MemState::target_key(namespace, manifest)) {
            return Err(KubectlError::ReplaceNotFound);
        }
        let key = st.store(namespace, manifest)?;
        st.ops.push(format!("replace {}", key));
        Ok(())
    }

    async fn force_replace(&self, _kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        let mut st = self.state.lock();
        let target = MemState::target_key(namespace, manifest);
        if st.objects.remove(&target).is_none() {
            return Err(KubectlError::ReplaceNotFound);
        }
        let key = st.store(namespace, manifest)?;
        st.ops.push(format!("force-replace {}", key));
        Ok(())
    }

    async fn delete(&self, _kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<()> {
        let mut st = self.state.lock();
        let k = MemState::lookup_key(namespace, key);
        if st.objects.remove(&k).is_none() {
            return Err(KubectlError::NotFound);
        }
        st.ops.push(format!("delete {}", k));
        Ok(())
    }

    async fn get(&self, _kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<Manifest> {
        let st = self.state.lock();
        st.objects.get(&MemState::lookup_key(namespace, key)).cloned().ok_or(KubectlError::NotFound)
    }

    async fn create_namespace(&self, _kubeconfig: &str, namespace: &str) -> KubectlResult<()> {
        let ns = Manifest::from_json(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": namespace},
        }))?;
        let mut st = self.state.lock();
        if st.objects.contains_key(&MemState::target_key("", &ns)) {
            return Err(KubectlError::AlreadyExists);
        }
        st.store("", &ns)?;
        st.ops.push(format!("create-namespace {}", namespace));
        Ok(())
    }

    async fn get_all(&self, _kubeconfig: &str, namespace: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>> {
        let sel = parse_selector(selector);
        let st = self.state.lock();
        Ok(st
            .objects
            .values()
            .filter(|m| !is_cluster_scoped_kind(m.kind()))
            .filter(|m| namespace.is_empty() || m.namespace() == namespace)
            .filter(|m| matches_selector(m, &sel))
            .cloned()
            .collect())
    }

    async fn get_all_cluster_scoped(&self, _kubeconfig: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>> {
        let sel = parse_selector(selector);
        let st = self.state.lock();
        Ok(st
            .objects
            .values()
            .filter(|m| is_cluster_scoped_kind(m.kind()))
            .filter(|m| matches_selector(m, &sel))
            .cloned()
            .collect())
    }
}
