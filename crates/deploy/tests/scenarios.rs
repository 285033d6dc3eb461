#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pipedk8s_apply::{InMemoryKubectl, KubectlOps};
use pipedk8s_core::{
    parse_manifests, ApplicationSyncStatus, BufferLogPersister, DeployTarget, Deployment, DeploymentSource,
    LocalToolRegistry, ResourceKey, StageStatus, SyncStrategy, Tools,
};
use pipedk8s_deploy::{Deployer, FixedKubectl, StageRequest};
use pipedk8s_loader::Loader;
use pipedk8s_store::{AppStore, StoreManager};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const APP_CONFIG: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec:\n  name: simple\n";
const PRUNE_CONFIG: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec:\n  name: simple\n  quickSync:\n    prune: true\n";

fn deployment(replicas: u32, image: &str) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: simple
  labels:
    app: simple
spec:
  replicas: {}
  selector:
    matchLabels:
      app: simple
  template:
    metadata:
      labels:
        app: simple
    spec:
      containers:
        - name: helloworld
          image: {}
          ports:
            - containerPort: 9085
"#,
        replicas, image
    )
}

const SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: simple
spec:
  selector:
    app: simple
  ports:
    - protocol: TCP
      port: 9085
      targetPort: 9085
"#;

struct App {
    dir: TempDir,
}

impl App {
    fn new(config: &str, files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.pipecd.yaml"), config).unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        Self { dir }
    }

    fn source(&self, commit: &str) -> DeploymentSource { DeploymentSource::load(self.dir.path(), commit, "").unwrap() }
}

fn deployer(k: &Arc<InMemoryKubectl>, stores: Arc<StoreManager>) -> Deployer {
    let tools = Tools::new(Arc::new(LocalToolRegistry::new(std::env::temp_dir().join("pipedk8s-test-tools"))));
    let kubectl: Arc<dyn KubectlOps> = k.clone();
    Deployer::new(Arc::new(Loader::new(tools)), Arc::new(FixedKubectl(kubectl)), stores).with_prune_wait(Duration::ZERO)
}

fn target() -> DeployTarget { DeployTarget { name: "default".into(), ..Default::default() } }

fn request(stage: &str, config: &str, running: DeploymentSource, target: DeploymentSource) -> StageRequest {
    StageRequest {
        stage_name: stage.into(),
        stage_config: config.as_bytes().to_vec(),
        running,
        target,
        deployment: Deployment {
            id: "deployment-id".into(),
            application_id: "app-id".into(),
            application_name: "simple".into(),
            piped_id: "piped-id".into(),
        },
    }
}

async fn execute(d: &Deployer, req: &StageRequest, lp: &BufferLogPersister) -> StageStatus {
    d.execute_stage(req, &[target()], lp, &CancellationToken::new()).await
}

fn key(group: &str, kind: &str, ns: &str, name: &str) -> ResourceKey { ResourceKey::new(group, kind, ns, name) }

#[tokio::test]
async fn s1_quick_sync_without_prune() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(1, "gcr.io/pipecd/helloworld:v0.5.0")), ("service.yaml", SERVICE)]);
    let lp = BufferLogPersister::new();

    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), app.source("0123456789")), &lp).await;
    assert_eq!(status, StageStatus::Success);

    let dep = k.object(&key("apps", "Deployment", "default", "simple")).unwrap();
    assert_eq!(dep.label("pipecd.dev/managed-by"), Some("piped"));
    assert_eq!(dep.label("pipecd.dev/application"), Some("app-id"));
    assert_eq!(dep.label("pipecd.dev/commit-hash"), Some("0123456789"));
    assert_eq!(dep.annotation("pipecd.dev/resource-key"), Some("apps:Deployment::simple"));
    assert!(k.object(&key("", "Service", "default", "simple")).is_some());
    assert!(lp.contains("Resource GC was skipped"));
}

#[tokio::test]
async fn s2_prune_moves_service_across_namespaces() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let service_in = |ns: &str| SERVICE.replacen("  name: simple\n", &format!("  name: simple\n  namespace: {}\n", ns), 1);
    let running = App::new(PRUNE_CONFIG, &[("service.yaml", &service_in("test-1"))]);
    let target_app = App::new(PRUNE_CONFIG, &[("service.yaml", &service_in("test-2"))]);

    let lp = BufferLogPersister::new();
    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), running.source("0123456789")), &lp).await;
    assert_eq!(status, StageStatus::Success);
    assert!(k.object(&key("", "Service", "test-1", "simple")).is_some());

    let lp = BufferLogPersister::new();
    let req = request("K8S_SYNC", "", running.source("0123456789"), target_app.source("0012345678"));
    assert_eq!(execute(&d, &req, &lp).await, StageStatus::Success);

    assert!(k.object(&key("", "Service", "test-1", "simple")).is_none());
    let svc = k.object(&key("", "Service", "test-2", "simple")).unwrap();
    assert_eq!(svc.label("pipecd.dev/commit-hash"), Some("0012345678"));
    assert_eq!(svc.annotation("pipecd.dev/resource-key"), Some(":Service:test-2:simple"));
    assert!(lp.contains("Successfully deleted 1 resources"));
}

#[tokio::test]
async fn prune_leaves_unlabelled_objects_alone() {
    let k = Arc::new(InMemoryKubectl::new());
    k.insert(parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: foreign\n  namespace: default\n").unwrap().remove(0));
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(PRUNE_CONFIG, &[("service.yaml", SERVICE)]);

    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), app.source("c1")), &BufferLogPersister::new()).await;
    assert_eq!(status, StageStatus::Success);
    assert!(k.object(&key("", "ConfigMap", "default", "foreign")).is_some());
    assert!(!k.ops().iter().any(|op| op.starts_with("delete")));
}

#[tokio::test]
async fn s3_baseline_rollout_with_service() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(2, "gcr.io/pipecd/helloworld:v0.5.0")), ("service.yaml", SERVICE)]);
    let running = app.source("0123456789");

    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), running.clone()), &BufferLogPersister::new()).await;
    assert_eq!(status, StageStatus::Success);

    let lp = BufferLogPersister::new();
    let req = request("K8S_BASELINE_ROLLOUT", r#"{"createService":true}"#, running.clone(), running);
    assert_eq!(execute(&d, &req, &lp).await, StageStatus::Success);

    let dep = k.object(&key("apps", "Deployment", "default", "simple-baseline")).unwrap();
    assert_eq!(dep.label("pipecd.dev/variant"), Some("baseline"));
    assert_eq!(dep.annotation("pipecd.dev/variant"), Some("baseline"));
    assert_eq!(dep.nested(&["spec", "replicas"]), Some(&serde_json::json!(1)));

    let svc = k.object(&key("", "Service", "default", "simple-baseline")).unwrap();
    assert_eq!(svc.nested(&["spec", "selector"]), Some(&serde_json::json!({"app": "simple", "pipecd.dev/variant": "baseline"})));
    assert_eq!(svc.nested(&["spec", "ports"]), Some(&serde_json::json!([{"port": 9085, "targetPort": 9085, "protocol": "TCP"}])));

    // The primary objects stay as they were.
    let primary = k.object(&key("apps", "Deployment", "default", "simple")).unwrap();
    assert_eq!(primary.label("pipecd.dev/variant"), Some("primary"));
}

#[tokio::test]
async fn s4_rollback_removes_canary_and_baseline() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let weight = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: canary-patch-weight-config\ndata:\n  weight: \"10\"\n";
    let running_app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(2, "helloworld:v0.5.0")), ("service.yaml", SERVICE), ("weight.yaml", weight)]);
    let target_app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(2, "helloworld:v0.6.0")), ("service.yaml", SERVICE), ("weight.yaml", weight)]);
    let running = running_app.source("running-hash");
    let target_src = target_app.source("target-hash");

    let steps = [("K8S_BASELINE_ROLLOUT", ""), ("K8S_PRIMARY_ROLLOUT", "")];
    for (stage, cfg) in steps {
        let status = execute(&d, &request(stage, cfg, running.clone(), target_src.clone()), &BufferLogPersister::new()).await;
        assert_eq!(status, StageStatus::Success, "{}", stage);
    }
    k.insert(
        parse_manifests(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: simple-canary\n  namespace: default\n  labels:\n    pipecd.dev/managed-by: piped\n    pipecd.dev/application: app-id\n    pipecd.dev/variant: canary\n  annotations:\n    pipecd.dev/resource-key: \"apps:Deployment::simple-canary\"\n",
        )
        .unwrap()
        .remove(0),
    );
    assert!(k.object(&key("apps", "Deployment", "default", "simple-baseline")).is_some());
    assert_eq!(
        k.object(&key("apps", "Deployment", "default", "simple")).unwrap().label("pipecd.dev/commit-hash"),
        Some("target-hash")
    );

    let lp = BufferLogPersister::new();
    let status = execute(&d, &request("K8S_ROLLBACK", "", running, target_src), &lp).await;
    assert_eq!(status, StageStatus::Success);

    assert!(k.object(&key("apps", "Deployment", "default", "simple-baseline")).is_none());
    assert!(k.object(&key("apps", "Deployment", "default", "simple-canary")).is_none());
    for kept in [
        key("apps", "Deployment", "default", "simple"),
        key("", "Service", "default", "simple"),
        key("", "ConfigMap", "default", "canary-patch-weight-config"),
    ] {
        let m = k.object(&kept).unwrap();
        assert_eq!(m.label("pipecd.dev/commit-hash"), Some("running-hash"), "{}", kept);
        assert_eq!(m.annotation("pipecd.dev/commit-hash"), Some("running-hash"), "{}", kept);
    }
}

#[tokio::test]
async fn rollback_without_running_commit_fails() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("service.yaml", SERVICE)]);
    let lp = BufferLogPersister::new();
    let status = execute(&d, &request("K8S_ROLLBACK", "", DeploymentSource::default(), app.source("c1")), &lp).await;
    assert_eq!(status, StageStatus::Failure);
    assert!(lp.contains("unable to determine the last deployed commit"));
    assert!(k.ops().is_empty());
}

#[tokio::test]
async fn s5_drift_is_reported_from_the_store() {
    let k = Arc::new(InMemoryKubectl::new());
    let stores = Arc::new(StoreManager::new());
    let store = Arc::new(AppStore::new("default"));
    let mut live = parse_manifests(&deployment(1, "nginx:1.19")).unwrap().remove(0);
    live.set_nested(&["metadata", "namespace"], serde_json::json!("default")).unwrap();
    live.set_nested(&["metadata", "uid"], serde_json::json!("d-1")).unwrap();
    live.add_labels([("pipecd.dev/managed-by", "piped"), ("pipecd.dev/application", "app-id")]).unwrap();
    store.on_add(live);
    assert!(stores.attach(store));

    let d = deployer(&k, stores);
    let app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(3, "nginx:1.20"))]);
    let report = d.get_livestate("app-id", "simple", &app.source("0123456789abc"), &[target()]).await.unwrap();

    assert_eq!(report.resources.len(), 1);
    assert_eq!(report.resources[0].id, "d-1");
    let sync = report.sync_state;
    assert_eq!(sync.status, ApplicationSyncStatus::OutOfSync);
    assert_eq!(sync.short_reason, "There are 1 manifests not synced (0 adds, 0 deletes, 1 changes)");
    assert!(sync.reason.contains("at commit 0123456 and actual state"), "{}", sync.reason);
    assert!(sync.reason.contains("-   replicas: 1\n+   replicas: 3\n"), "{}", sync.reason);
    assert!(sync.reason.contains("-           image: nginx:1.19\n+           image: nginx:1.20\n"), "{}", sync.reason);
    assert!(k.ops().is_empty());
}

#[tokio::test]
async fn livestate_falls_back_to_kubectl() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(1, "nginx:1.19")), ("service.yaml", SERVICE)]);
    let source = app.source("c1");
    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), source.clone()), &BufferLogPersister::new()).await;
    assert_eq!(status, StageStatus::Success);

    let report = d.get_livestate("app-id", "simple", &source, &[target()]).await.unwrap();
    assert_eq!(report.sync_state.status, ApplicationSyncStatus::Synced);
    let mut kinds: Vec<_> = report.resources.iter().map(|r| r.resource_type.as_str()).collect();
    kinds.sort();
    assert_eq!(kinds, vec!["Deployment", "Service"]);
}

#[tokio::test]
async fn s6_traffic_routing_rejects_split() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("service.yaml", SERVICE)]);
    let source = app.source("c1");
    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), source.clone()), &BufferLogPersister::new()).await;
    assert_eq!(status, StageStatus::Success);
    let before = k.object(&key("", "Service", "default", "simple")).unwrap();
    k.clear_ops();

    let lp = BufferLogPersister::new();
    let req = request("K8S_TRAFFIC_ROUTING", r#"{"primary":50,"canary":50}"#, source.clone(), source.clone());
    assert_eq!(execute(&d, &req, &lp).await, StageStatus::Failure);
    assert!(lp.contains("primary=50, canary=50, baseline=0"));
    assert!(k.ops().is_empty());
    assert_eq!(k.object(&key("", "Service", "default", "simple")).unwrap(), before);

    let lp = BufferLogPersister::new();
    let req = request("K8S_TRAFFIC_ROUTING", r#"{"all":"canary"}"#, source.clone(), source);
    assert_eq!(execute(&d, &req, &lp).await, StageStatus::Success);
    let svc = k.object(&key("", "Service", "default", "simple")).unwrap();
    assert_eq!(svc.nested_str(&["spec", "selector", "pipecd.dev/variant"]), Some("canary"));
}

#[tokio::test]
async fn canary_clean_deletes_only_canary_objects() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("deployment.yaml", &deployment(2, "helloworld:v1")), ("service.yaml", SERVICE)]);
    let source = app.source("c1");
    let status = execute(&d, &request("K8S_SYNC", "", DeploymentSource::default(), source.clone()), &BufferLogPersister::new()).await;
    assert_eq!(status, StageStatus::Success);
    k.insert(
        parse_manifests(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: simple-canary\n  namespace: default\n  labels:\n    pipecd.dev/managed-by: piped\n    pipecd.dev/application: app-id\n    pipecd.dev/variant: canary\n  annotations:\n    pipecd.dev/resource-key: \":Service::simple-canary\"\n",
        )
        .unwrap()
        .remove(0),
    );
    k.clear_ops();

    let lp = BufferLogPersister::new();
    assert_eq!(execute(&d, &request("K8S_CANARY_CLEAN", "", source.clone(), source), &lp).await, StageStatus::Success);
    let ops = k.ops();
    assert_eq!(ops.len(), 1, "{:?}", ops);
    assert!(ops[0].starts_with("delete ") && ops[0].ends_with("simple-canary"), "{:?}", ops);
    assert!(k.object(&key("apps", "Deployment", "default", "simple")).is_some());
}

#[tokio::test]
async fn request_validation_and_cancellation() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let app = App::new(APP_CONFIG, &[("service.yaml", SERVICE)]);
    let source = app.source("c1");

    let lp = BufferLogPersister::new();
    assert_eq!(execute(&d, &request("K8S_UNKNOWN", "", source.clone(), source.clone()), &lp).await, StageStatus::Failure);
    assert!(lp.contains("unsupported stage K8S_UNKNOWN"));

    let lp = BufferLogPersister::new();
    let req = request("K8S_SYNC", "", source.clone(), source.clone());
    let two = [target(), DeployTarget { name: "other".into(), ..Default::default() }];
    assert_eq!(d.execute_stage(&req, &two, &lp, &CancellationToken::new()).await, StageStatus::Failure);
    assert_eq!(d.execute_stage(&req, &[], &lp, &CancellationToken::new()).await, StageStatus::Failure);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(d.execute_stage(&req, &[target()], &BufferLogPersister::new(), &cancel).await, StageStatus::Exited);

    let lp = BufferLogPersister::new();
    assert_eq!(execute(&d, &request("K8S_CANARY_ROLLOUT", "", source.clone(), source), &lp).await, StageStatus::Failure);
    assert!(lp.contains("not yet implemented"));
    assert!(k.ops().is_empty());
}

#[tokio::test]
async fn plan_preview_and_strategy() {
    let k = Arc::new(InMemoryKubectl::new());
    let d = deployer(&k, Arc::new(StoreManager::new()));
    let pipeline = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec:\n  name: simple\n  pipeline:\n    stages:\n      - name: K8S_CANARY_ROLLOUT\n      - name: K8S_PRIMARY_ROLLOUT\n";
    let running_app = App::new(pipeline, &[("deployment.yaml", &deployment(2, "helloworld:v0.5.0")), ("service.yaml", SERVICE)]);
    let target_app = App::new(pipeline, &[("deployment.yaml", &deployment(2, "helloworld:v0.6.0")), ("service.yaml", SERVICE)]);
    let running = running_app.source("r1");
    let target_src = target_app.source("t1");

    let first = d.plan_preview("simple", &running, &target_src, &[target()]).await.unwrap();
    let second = d.plan_preview("simple", &running, &target_src, &[target()]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0].summary, "0 added manifests, 1 changed manifests, 0 deleted manifests");
    assert_eq!(first[0].diff_language, "diff");
    assert!(!first[0].no_change);

    let same = d.plan_preview("simple", &running, &running, &[target()]).await.unwrap();
    assert!(same[0].no_change);
    assert_eq!(same[0].summary, "No changes were detected");

    let decision = d.determine_strategy("simple", &running, &target_src, &target()).await.unwrap();
    assert_eq!(decision.strategy, SyncStrategy::Pipeline);
    assert!(decision.summary.contains("image helloworld from v0.5.0 to v0.6.0"), "{}", decision.summary);

    let first_deploy = d.determine_strategy("simple", &DeploymentSource::default(), &target_src, &target()).await.unwrap();
    assert_eq!(first_deploy.strategy, SyncStrategy::QuickSync);

    let versions = d.determine_versions("simple", &target_src, &target()).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, "v0.6.0");
}
