//! One live-state store per deploy target, started at most once.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use pipedk8s_core::DeployTarget;
use pipedk8s_kubehub::{build_client, discover, spawn_watchers, ResourceMatcher};
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ingest::{queue_cap_from_env, spawn_ingest, IngestHandle};
use crate::AppStore;

struct Running {
    store: Arc<AppStore>,
    ingest: Mutex<Option<IngestHandle>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Arc<Running>>,
}

pub struct StoreManager {
    slots: Mutex<FxHashMap<String, Arc<Slot>>>,
    cancel: CancellationToken,
}

impl Default for StoreManager {
    fn default() -> Self { Self::new() }
}

impl StoreManager {
    pub fn new() -> Self { Self { slots: Mutex::new(FxHashMap::default()), cancel: CancellationToken::new() } }

    fn slot(&self, name: &str) -> Arc<Slot> { Arc::clone(self.slots.lock().entry(name.to_string()).or_default()) }

    /// Discover and start watching the target's cluster. Concurrent and
    /// repeated calls share the first successful start.
    pub async fn initialize(&self, target: &DeployTarget) -> Result<Arc<AppStore>> {
        if self.cancel.is_cancelled() {
            bail!("live-state store manager is shut down");
        }
        let slot = self.slot(&target.name);
        let running = slot.cell.get_or_try_init(|| start(target, self.cancel.child_token())).await?;
        Ok(Arc::clone(&running.store))
    }

    /// Register a store fed by something other than cluster watchers.
    /// Returns false when the target already has a store.
    pub fn attach(&self, store: Arc<AppStore>) -> bool {
        let slot = self.slot(store.deploy_target());
        slot.cell.set(Arc::new(Running { store, ingest: Mutex::new(None), watchers: Mutex::new(Vec::new()) })).is_ok()
    }

    pub fn get(&self, deploy_target: &str) -> Option<Arc<AppStore>> {
        let slot = self.slots.lock().get(deploy_target).cloned()?;
        slot.cell.get().map(|r| Arc::clone(&r.store))
    }

    pub fn is_shut_down(&self) -> bool { self.cancel.is_cancelled() }

    /// Stop every watcher and ingest loop; later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            let Some(running) = slot.cell.get() else { continue };
            let watchers = std::mem::take(&mut *running.watchers.lock());
            for w in watchers {
                let _ = w.await;
            }
            let ingest = running.ingest.lock().take();
            if let Some(ingest) = ingest {
                ingest.join().await;
            }
            info!(target_name = %running.store.deploy_target(), "live-state store stopped");
        }
    }
}

async fn start(target: &DeployTarget, cancel: CancellationToken) -> Result<Arc<Running>> {
    let started = Instant::now();
    let informer = &target.config.app_state_informer;
    let client = build_client(&target.config.kubeconfig_path).await?;
    let matcher = ResourceMatcher::new(informer);
    let resources = discover(&client, &matcher, &informer.namespace).await?;

    let store = Arc::new(AppStore::new(target.name.clone()));
    store.set_watching_kinds(resources.iter().map(|r| r.group_kind()));
    let (tx, ingest) = spawn_ingest(Arc::clone(&store), queue_cap_from_env(), cancel.clone());
    let watchers = spawn_watchers(client, resources, informer.namespace.clone(), tx, cancel);
    info!(
        target_name = %target.name,
        watchers = watchers.len(),
        took_ms = started.elapsed().as_millis() as u64,
        "live-state store started"
    );
    Ok(Arc::new(Running { store, ingest: Mutex::new(Some(ingest)), watchers: Mutex::new(watchers) }))
}
