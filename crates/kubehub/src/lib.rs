//! piped-k8s kubehub: kube client, API discovery and list/watch streams

#![forbid(unsafe_code)]

mod matcher;

use std::time::Instant;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ApiResource, DynamicObject, TypeMeta},
    config::{KubeConfigOptions, Kubeconfig},
    discovery::{verbs, ApiCapabilities, Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use metrics::counter;
use pipedk8s_core::Manifest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use matcher::ResourceMatcher;

/// Client for one deploy target. An empty path uses the in-cluster or
/// ambient configuration.
pub async fn build_client(kubeconfig_path: &str) -> Result<Client> {
    if kubeconfig_path.is_empty() {
        return Client::try_default().await.context("building default kube client");
    }
    let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
        .with_context(|| format!("reading kubeconfig {}", kubeconfig_path))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", kubeconfig_path))?;
    Client::try_from(config).context("building kube client")
}

/// A served resource the store lists and watches.
#[derive(Debug, Clone)]
pub struct WatchedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl WatchedResource {
    pub fn api_version(&self) -> &str { &self.api_resource.api_version }
    pub fn kind(&self) -> &str { &self.api_resource.kind }

    /// `Kind.group`, or just `Kind` for the core group; the same form as
    /// `ResourceKey::group_kind`.
    pub fn group_kind(&self) -> String {
        if self.api_resource.group.is_empty() {
            self.api_resource.kind.clone()
        } else {
            format!("{}.{}", self.api_resource.kind, self.api_resource.group)
        }
    }
}

/// Keep resources the matcher accepts that support both list and watch.
/// Cluster-scoped resources are only kept when watching all namespaces.
pub fn select_resources<I>(candidates: I, matcher: &ResourceMatcher, namespace: &str) -> Vec<WatchedResource>
where
    I: IntoIterator<Item = (ApiResource, ApiCapabilities)>,
{
    let mut out: Vec<WatchedResource> = candidates
        .into_iter()
        .filter(|(_, caps)| caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH))
        .filter(|(ar, _)| matcher.is_matched(&ar.api_version, &ar.kind))
        .filter_map(|(ar, caps)| {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            if !namespaced && !namespace.is_empty() {
                return None;
            }
            Some(WatchedResource { api_resource: ar, namespaced })
        })
        .collect();
    out.sort_by(|a, b| a.api_version().cmp(b.api_version()).then_with(|| a.kind().cmp(b.kind())));
    out
}

/// Discover served resources (incl. CRDs) and filter them for watching.
pub async fn discover(client: &Client, matcher: &ResourceMatcher, namespace: &str) -> Result<Vec<WatchedResource>> {
    let started = Instant::now();
    let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
    let candidates = discovery.groups().flat_map(|g| g.recommended_resources());
    let out = select_resources(candidates, matcher, namespace);
    info!(resources = out.len(), took_ms = started.elapsed().as_millis() as u64, "api discovery done");
    Ok(out)
}

/// Changes observed on one watched resource.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Manifest),
    Deleted(Manifest),
    /// The watch (re)listed; `items` is the full current set for `group_kind`.
    Resync { group_kind: String, items: Vec<Manifest> },
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Watched objects arrive without type meta; restore it from the resource.
pub fn manifest_from(mut obj: DynamicObject, ar: &ApiResource) -> Result<Manifest> {
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Manifest::from_json(raw).context("converting watched object")
}

fn convert(obj: DynamicObject, resource: &WatchedResource) -> Option<Manifest> {
    match manifest_from(obj, &resource.api_resource) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(kind = %resource.kind(), error = %e, "skipping watched object");
            None
        }
    }
}

/// List+watch one resource and forward events until the stream or the
/// receiver ends.
pub async fn start_watcher(client: Client, resource: WatchedResource, namespace: &str, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
    let ar = &resource.api_resource;
    let api: Api<DynamicObject> = if resource.namespaced && !namespace.is_empty() {
        Api::namespaced_with(client, namespace, ar)
    } else {
        Api::all_with(client, ar)
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(api_version = %resource.api_version(), kind = %resource.kind(), ns = %namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        // Errors are retried by the backoff layer; the stream keeps going.
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind = %resource.kind(), error = %e, "watch error");
                continue;
            }
        };
        let event = match ev {
            Event::Applied(o) => match convert(o, &resource) {
                Some(m) => WatchEvent::Applied(m),
                None => continue,
            },
            Event::Deleted(o) => match convert(o, &resource) {
                Some(m) => WatchEvent::Deleted(m),
                None => continue,
            },
            Event::Restarted(list) => {
                debug!(kind = %resource.kind(), count = list.len(), "watch restart");
                let items = list.into_iter().filter_map(|o| convert(o, &resource)).collect();
                WatchEvent::Resync { group_kind: resource.group_kind(), items }
            }
        };
        counter!("livestate_events_total", 1u64, "kind" => resource.kind().to_string());
        if tx.send(event).await.is_err() {
            debug!(kind = %resource.kind(), "event receiver closed");
            return Ok(());
        }
    }
    warn!(kind = %resource.kind(), "watcher stream ended");
    Ok(())
}

/// One watcher task per resource, all stopped by `cancel`.
pub fn spawn_watchers(
    client: Client,
    resources: Vec<WatchedResource>,
    namespace: String,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    resources
        .into_iter()
        .map(|resource| {
            let client = client.clone();
            let tx = tx.clone();
            let namespace = namespace.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let kind = resource.kind().to_string();
                tokio::select! {
                    _ = cancel.cancelled() => debug!(%kind, "watcher cancelled"),
                    res = start_watcher(client, resource, &namespace, tx) => {
                        if let Err(e) = res {
                            warn!(%kind, error = %e, "watcher failed");
                        }
                    }
                }
            })
        })
        .collect()
}
