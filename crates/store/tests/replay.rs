#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pipedk8s_core::Manifest;
use pipedk8s_kubehub::WatchEvent;
use pipedk8s_store::{spawn_ingest, AppStore, StoreManager};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn obj(api_version: &str, kind: &str, name: &str, uid: &str, app: Option<&str>, owner: Option<&str>) -> Manifest {
    let mut meta = serde_json::json!({ "name": name, "namespace": "default", "uid": uid });
    if let Some(app) = app {
        meta["labels"] = serde_json::json!({ "pipecd.dev/managed-by": "piped", "pipecd.dev/application": app });
    }
    if let Some(owner) = owner {
        meta["ownerReferences"] = serde_json::json!([{ "apiVersion": "apps/v1", "kind": "Owner", "name": "o", "uid": owner }]);
    }
    Manifest::from_json(serde_json::json!({ "apiVersion": api_version, "kind": kind, "metadata": meta })).unwrap()
}

fn names(ms: &[Manifest]) -> Vec<String> { ms.iter().map(|m| format!("{}/{}", m.kind(), m.name())).collect() }

#[test]
fn replay_owner_chain() {
    let store = AppStore::new("dev");
    let events = vec![
        WatchEvent::Applied(obj("apps/v1", "Deployment", "simple", "d-1", Some("app-1"), None)),
        WatchEvent::Applied(obj("apps/v1", "ReplicaSet", "simple-5d4", "rs-1", None, Some("d-1"))),
        WatchEvent::Applied(obj("v1", "Pod", "simple-5d4-x", "p-1", None, Some("rs-1"))),
        WatchEvent::Applied(obj("v1", "Service", "simple", "s-1", Some("app-1"), None)),
        WatchEvent::Applied(obj("v1", "Service", "other", "s-2", Some("app-2"), None)),
        WatchEvent::Applied(obj("v1", "Pod", "stray", "p-9", None, Some("unknown"))),
    ];
    for ev in events {
        store.apply(ev);
    }

    assert_eq!(names(&store.managed_resources("app-1")), vec!["Service/simple", "Deployment/simple"]);
    assert_eq!(
        names(&store.resources("app-1")),
        vec!["Pod/simple-5d4-x", "Service/simple", "Deployment/simple", "ReplicaSet/simple-5d4"]
    );
    assert_eq!(store.app_ids(), vec!["app-1", "app-2"]);
    assert_eq!(store.len(), 5);

    store.apply(WatchEvent::Deleted(obj("v1", "Pod", "simple-5d4-x", "p-1", None, Some("rs-1"))));
    store.apply(WatchEvent::Deleted(obj("v1", "Service", "other", "s-2", Some("app-2"), None)));
    assert_eq!(store.resources("app-1").len(), 3);
    assert!(store.resources("app-2").is_empty());
    assert_eq!(store.app_ids(), vec!["app-1"]);
}

#[test]
fn resync_drops_vanished_objects_of_that_kind_only() {
    let store = AppStore::new("dev");
    store.on_add(obj("v1", "Service", "a", "s-a", Some("app-1"), None));
    store.on_add(obj("v1", "Service", "b", "s-b", Some("app-1"), None));
    store.on_add(obj("apps/v1", "Deployment", "simple", "d-1", Some("app-1"), None));

    store.apply(WatchEvent::Resync {
        group_kind: "Service".to_string(),
        items: vec![obj("v1", "Service", "b", "s-b", Some("app-1"), None), obj("v1", "Service", "c", "s-c", Some("app-1"), None)],
    });

    assert_eq!(names(&store.managed_resources("app-1")), vec!["Service/b", "Service/c", "Deployment/simple"]);
}

#[test]
fn relabelled_object_moves_between_applications() {
    let store = AppStore::new("dev");
    let old = obj("v1", "ConfigMap", "shared", "c-1", Some("app-1"), None);
    store.on_add(old.clone());
    store.on_update(&old, obj("v1", "ConfigMap", "shared", "c-1", Some("app-2"), None));
    assert!(store.resources("app-1").is_empty());
    assert_eq!(names(&store.resources("app-2")), vec!["ConfigMap/shared"]);
}

#[tokio::test]
async fn ingest_applies_events_and_bumps_epoch() {
    let store = Arc::new(AppStore::new("dev"));
    let (tx, handle) = spawn_ingest(Arc::clone(&store), 16, CancellationToken::new());
    let mut epoch_rx = handle.subscribe_epoch();

    tx.send(WatchEvent::Applied(obj("apps/v1", "Deployment", "simple", "d-1", Some("app-1"), None))).await.unwrap();
    tx.send(WatchEvent::Applied(obj("v1", "Service", "simple", "s-1", Some("app-1"), None))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), epoch_rx.changed()).await.unwrap().unwrap();
    assert!(*epoch_rx.borrow() >= 1);

    drop(tx);
    handle.join().await;
    assert_eq!(store.managed_resources("app-1").len(), 2);
}

#[tokio::test]
async fn manager_attach_get_and_shutdown() {
    let mgr = StoreManager::new();
    let store = Arc::new(AppStore::new("dev"));
    store.set_watching_kinds(["Deployment.apps", "Service"]);
    assert!(mgr.attach(Arc::clone(&store)));
    assert!(!mgr.attach(Arc::new(AppStore::new("dev"))));

    let got = mgr.get("dev").unwrap();
    assert!(Arc::ptr_eq(&got, &store));
    assert!(mgr.get("prod").is_none());
    assert!(got.watching_kinds().unwrap().contains("Service"));

    mgr.shutdown().await;
    mgr.shutdown().await;
    assert!(mgr.is_shut_down());
    let target = pipedk8s_core::DeployTarget { name: "prod".into(), ..Default::default() };
    assert!(mgr.initialize(&target).await.is_err());
}
