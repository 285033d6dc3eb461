//! Which kubectl a stage talks to.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use pipedk8s_apply::{KubectlCli, KubectlOps};
use pipedk8s_core::Tools;
use rustc_hash::FxHashMap;

#[async_trait]
pub trait KubectlResolver: Send + Sync {
    /// A kubectl for `version`; empty means the default version.
    async fn kubectl(&self, version: &str) -> Result<Arc<dyn KubectlOps>>;
}

/// Installs kubectl binaries through the tool registry, one per version.
pub struct ToolKubectlResolver {
    tools: Tools,
    cache: Mutex<FxHashMap<String, Arc<dyn KubectlOps>>>,
}

impl ToolKubectlResolver {
    pub fn new(tools: Tools) -> Self { Self { tools, cache: Mutex::new(FxHashMap::default()) } }
}

#[async_trait]
impl KubectlResolver for ToolKubectlResolver {
    async fn kubectl(&self, version: &str) -> Result<Arc<dyn KubectlOps>> {
        if let Some(k) = self.cache.lock().get(version).cloned() {
            return Ok(k);
        }
        let path = self.tools.kubectl(version).await?;
        let k: Arc<dyn KubectlOps> = Arc::new(KubectlCli::new(path));
        self.cache.lock().insert(version.to_string(), k.clone());
        Ok(k)
    }
}

/// Always the same kubectl, whatever the version.
#[derive(Clone)]
pub struct FixedKubectl(pub Arc<dyn KubectlOps>);

#[async_trait]
impl KubectlResolver for FixedKubectl {
    async fn kubectl(&self, _version: &str) -> Result<Arc<dyn KubectlOps>> { Ok(self.0.clone()) }
}
