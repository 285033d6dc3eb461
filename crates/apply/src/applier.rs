//! Applying and deleting manifests against one deploy target.

use std::sync::Arc;

use pipedk8s_core::config::KubernetesDeploymentInput;
use pipedk8s_core::labels;
use pipedk8s_core::model::KubernetesDeployTargetConfig;
use pipedk8s_core::{Manifest, ResourceKey, StageLogPersister};
use tracing::{debug, info};

use crate::kubectl::{KubectlError, KubectlOps, KubectlResult};

/// How a manifest is pushed to the cluster, chosen from its annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    Apply { server_side: bool },
    Replace,
    ForceReplace,
}

impl ApplyPolicy {
    /// `force-sync-by-replace` wins over `sync-by-replace`, which wins over apply.
    pub fn for_manifest(m: &Manifest) -> Self {
        if m.annotation(labels::FORCE_SYNC_BY_REPLACE) == Some(labels::ENABLED) {
            return ApplyPolicy::ForceReplace;
        }
        if m.annotation(labels::SYNC_BY_REPLACE) == Some(labels::ENABLED) {
            return ApplyPolicy::Replace;
        }
        ApplyPolicy::Apply { server_side: m.annotation(labels::SERVER_SIDE_APPLY) == Some(labels::TRUE) }
    }
}

#[derive(Clone)]
pub struct Applier {
    kubectl: Arc<dyn KubectlOps>,
    kubeconfig: String,
    namespace: String,
    auto_create_namespace: bool,
}

impl Applier {
    pub fn new(kubectl: Arc<dyn KubectlOps>, input: &KubernetesDeploymentInput, target: &KubernetesDeployTargetConfig) -> Self {
        Self {
            kubectl,
            kubeconfig: target.kubeconfig_path.clone(),
            namespace: input.namespace.clone(),
            auto_create_namespace: input.auto_create_namespace,
        }
    }

    pub fn kubectl(&self) -> &Arc<dyn KubectlOps> { &self.kubectl }
    pub fn kubeconfig(&self) -> &str { &self.kubeconfig }

    /// The input namespace when set, the manifest's own otherwise.
    fn namespace_for<'a>(&'a self, m: &'a Manifest) -> &'a str {
        if self.namespace.is_empty() { m.namespace() } else { &self.namespace }
    }

    async fn ensure_namespace(&self, namespace: &str) -> KubectlResult<()> {
        if !self.auto_create_namespace || namespace.is_empty() {
            return Ok(());
        }
        match self.kubectl.create_namespace(&self.kubeconfig, namespace).await {
            Ok(()) => {
                info!(namespace, "created namespace");
                Ok(())
            }
            Err(KubectlError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Push `m` following its [`ApplyPolicy`]; a replace of a missing object
    /// falls back to create.
    pub async fn apply_manifest(&self, m: &Manifest) -> KubectlResult<ApplyPolicy> {
        let ns = self.namespace_for(m);
        self.ensure_namespace(ns).await?;
        let policy = ApplyPolicy::for_manifest(m);
        let res = match policy {
            ApplyPolicy::Apply { server_side } => self.kubectl.apply(&self.kubeconfig, ns, m, server_side).await,
            ApplyPolicy::Replace => match self.kubectl.replace(&self.kubeconfig, ns, m).await {
                Err(KubectlError::ReplaceNotFound) => self.kubectl.create(&self.kubeconfig, ns, m).await,
                other => other,
            },
            ApplyPolicy::ForceReplace => match self.kubectl.force_replace(&self.kubeconfig, ns, m).await {
                Err(KubectlError::ReplaceNotFound) => self.kubectl.create(&self.kubeconfig, ns, m).await,
                other => other,
            },
        };
        res.map(|_| policy)
    }

    pub async fn create_manifest(&self, m: &Manifest) -> KubectlResult<()> {
        let ns = self.namespace_for(m);
        self.ensure_namespace(ns).await?;
        self.kubectl.create(&self.kubeconfig, ns, m).await
    }

    pub async fn replace_manifest(&self, m: &Manifest) -> KubectlResult<()> {
        self.kubectl.replace(&self.kubeconfig, self.namespace_for(m), m).await
    }

    pub async fn force_replace_manifest(&self, m: &Manifest) -> KubectlResult<()> {
        self.kubectl.force_replace(&self.kubeconfig, self.namespace_for(m), m).await
    }

    /// Delete the object at `key`, but only if its `resource-key` annotation
    /// names the same resource; anything else reports `NotFound`.
    pub async fn delete(&self, key: &ResourceKey) -> KubectlResult<()> {
        let live = self.kubectl.get(&self.kubeconfig, key.namespace(), key).await?;
        let annotated = live.annotation(labels::RESOURCE_KEY).and_then(|s| s.parse::<ResourceKey>().ok());
        match annotated {
            Some(k) if k.normalized_eq(key) => self.kubectl.delete(&self.kubeconfig, key.namespace(), key).await,
            _ => {
                debug!(key = %key, "live object is not ours; refusing to delete");
                Err(KubectlError::NotFound)
            }
        }
    }
}

/// Apply every manifest in order, logging each one; stops at the first error.
pub async fn apply_manifests(applier: &Applier, manifests: &[Manifest], lp: &dyn StageLogPersister) -> KubectlResult<()> {
    lp.info(&format!("Start applying {} manifests", manifests.len()));
    for m in manifests {
        let key = m.key();
        match applier.apply_manifest(m).await {
            Ok(policy) => {
                let verb = match policy {
                    ApplyPolicy::Apply { .. } => "applied",
                    ApplyPolicy::Replace => "replaced",
                    ApplyPolicy::ForceReplace => "force-replaced",
                };
                lp.info(&format!("- {} manifest: {}", verb, key.readable_string()));
            }
            Err(e) => {
                lp.error(&format!("Failed to apply manifest: {} (error: {})", key.readable_string(), e));
                return Err(e);
            }
        }
    }
    lp.success(&format!("Successfully applied {} manifests", manifests.len()));
    Ok(())
}
