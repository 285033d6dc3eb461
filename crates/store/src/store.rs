//! Application-indexed view of the live objects of one deploy target.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pipedk8s_core::{labels, Manifest, ResourceState};
use pipedk8s_kubehub::WatchEvent;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::health::determine_health;

#[derive(Debug, Clone)]
struct Tracked {
    manifest: Manifest,
    /// Resolved by its own application label rather than through the index.
    managed: bool,
}

#[derive(Default)]
struct StoreInner {
    /// appID -> uid -> object
    apps: FxHashMap<String, FxHashMap<String, Tracked>>,
    uid_to_app: FxHashMap<String, String>,
}

impl StoreInner {
    /// Label first, then the uid's earlier attribution (`indexed`, or the
    /// index itself), then the owners.
    fn resolve_app(&self, m: &Manifest, indexed: Option<String>) -> Option<(String, bool)> {
        if let Some(app) = m.label(labels::APPLICATION).filter(|a| !a.is_empty()) {
            return Some((app.to_string(), true));
        }
        if let Some(app) = indexed.or_else(|| self.uid_to_app.get(m.uid()).cloned()) {
            return Some((app, false));
        }
        m.owner_uids().into_iter().find_map(|owner| self.uid_to_app.get(owner)).map(|app| (app.clone(), false))
    }

    fn add(&mut self, m: Manifest, indexed: Option<String>) -> bool {
        let uid = m.uid().to_string();
        if uid.is_empty() {
            trace!(kind = %m.kind(), name = %m.name(), "object without uid ignored");
            return false;
        }
        let Some((app, managed)) = self.resolve_app(&m, indexed) else {
            return false;
        };
        self.uid_to_app.insert(uid.clone(), app.clone());
        self.apps.entry(app).or_default().insert(uid, Tracked { manifest: m, managed });
        true
    }

    fn delete(&mut self, uid: &str) -> bool {
        let Some(app) = self.uid_to_app.remove(uid) else {
            return false;
        };
        if let Some(bucket) = self.apps.get_mut(&app) {
            bucket.remove(uid);
            if bucket.is_empty() {
                self.apps.remove(&app);
            }
        }
        true
    }

    /// Drop `old_uid` and add `m`, keeping the attribution `old_uid` had.
    fn replace(&mut self, old_uid: &str, m: Manifest) -> bool {
        let indexed = self.uid_to_app.get(old_uid).cloned();
        self.delete(old_uid);
        self.add(m, indexed)
    }
}

/// Tracks, per application, the live objects of one deploy target.
///
/// Objects are attributed to an application by their `pipecd.dev/application`
/// label, by an earlier attribution of the same uid, or through their
/// `ownerReferences`. Objects that resolve to no application are dropped.
pub struct AppStore {
    deploy_target: String,
    inner: RwLock<StoreInner>,
    watching: ArcSwapOption<BTreeSet<String>>,
}

impl AppStore {
    pub fn new(deploy_target: impl Into<String>) -> Self {
        Self { deploy_target: deploy_target.into(), inner: RwLock::new(StoreInner::default()), watching: ArcSwapOption::empty() }
    }

    pub fn deploy_target(&self) -> &str { &self.deploy_target }

    /// Returns whether the object was attributed to an application.
    pub fn on_add(&self, m: Manifest) -> bool {
        let uid = m.uid().to_string();
        self.inner.write().replace(&uid, m)
    }

    /// Delete then add under one write lock, so readers never observe the
    /// bucket without the object. An object attributed through its owners
    /// stays with that application even once the owner is gone.
    pub fn on_update(&self, old: &Manifest, new: Manifest) -> bool { self.inner.write().replace(old.uid(), new) }

    pub fn on_delete(&self, m: &Manifest) -> bool { self.inner.write().delete(m.uid()) }

    /// Replace everything tracked for `group_kind` with `items`.
    pub fn resync(&self, group_kind: &str, items: Vec<Manifest>) {
        let keep: FxHashSet<String> = items.iter().map(|m| m.uid().to_string()).collect();
        let mut inner = self.inner.write();
        let stale: Vec<Manifest> = inner
            .apps
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|t| t.manifest.key().group_kind() == group_kind && !keep.contains(t.manifest.uid()))
            .map(|t| t.manifest.clone())
            .collect();
        for m in &stale {
            inner.delete(m.uid());
        }
        let mut added = 0usize;
        for m in items {
            let uid = m.uid().to_string();
            if inner.replace(&uid, m) {
                added += 1;
            }
        }
        debug!(group_kind, removed = stale.len(), tracked = added, "resynced resource");
    }

    pub fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Applied(m) => {
                self.on_add(m);
            }
            WatchEvent::Deleted(m) => {
                self.on_delete(&m);
            }
            WatchEvent::Resync { group_kind, items } => self.resync(&group_kind, items),
        }
    }

    /// Objects carrying the application's label, sorted by key.
    pub fn managed_resources(&self, app_id: &str) -> Vec<Manifest> { self.collect(app_id, true) }

    /// Managed objects and their dependents, sorted by key.
    pub fn resources(&self, app_id: &str) -> Vec<Manifest> { self.collect(app_id, false) }

    fn collect(&self, app_id: &str, managed_only: bool) -> Vec<Manifest> {
        let inner = self.inner.read();
        let Some(bucket) = inner.apps.get(app_id) else {
            return Vec::new();
        };
        let mut out: Vec<Manifest> =
            bucket.values().filter(|t| t.managed || !managed_only).map(|t| t.manifest.clone()).collect();
        drop(inner);
        out.sort_by_key(|m| m.key());
        out
    }

    /// Every tracked object of the application projected for reporting.
    pub fn livestate(&self, app_id: &str) -> Vec<ResourceState> {
        let now = Utc::now();
        self.resources(app_id).iter().map(|m| resource_state(m, &self.deploy_target, now)).collect()
    }

    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of tracked objects across all applications.
    pub fn len(&self) -> usize { self.inner.read().uid_to_app.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn set_watching_kinds<I, S>(&self, kinds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = kinds.into_iter().map(Into::into).collect();
        self.watching.store(Some(Arc::new(set)));
    }

    /// `Kind.group` names being watched; `None` until discovery finished.
    pub fn watching_kinds(&self) -> Option<Arc<BTreeSet<String>>> { self.watching.load_full() }
}

/// Project a live object into the reported shape.
pub fn resource_state(m: &Manifest, deploy_target: &str, now: DateTime<Utc>) -> ResourceState {
    let (health_status, health_description) = determine_health(m);
    let mut resource_metadata = std::collections::BTreeMap::new();
    resource_metadata.insert("Namespace".to_string(), m.namespace().to_string());
    resource_metadata.insert("API Version".to_string(), m.api_version().to_string());
    resource_metadata.insert("Kind".to_string(), m.kind().to_string());
    let created_at = m
        .nested_str(&["metadata", "creationTimestamp"])
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    ResourceState {
        id: m.uid().to_string(),
        parent_ids: m.owner_uids().into_iter().map(str::to_string).collect::<SmallVec<[String; 2]>>(),
        name: m.name().to_string(),
        resource_type: m.kind().to_string(),
        resource_metadata,
        health_status,
        health_description,
        deploy_target: deploy_target.to_string(),
        created_at,
        updated_at: now,
    }
}
