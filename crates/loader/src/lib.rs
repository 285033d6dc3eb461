//! piped-k8s loader: turn an application directory into manifests

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use pipedk8s_core::config::{ConfigError, KubernetesDeploymentInput};
use pipedk8s_core::{labels, parse_manifests, Manifest, ManifestError, Tools};
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tracing::{debug, info};

pub mod helm;
pub mod kustomize;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("reading {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("values file {0} references outside the application configuration directory")]
    OutsideAppDir(String),
    #[error("values file {path} uses unsupported scheme {scheme}")]
    UnsupportedScheme { path: String, scheme: String },
    #[error("helm chart from git remote {0} is not supported")]
    UnsupportedChart(String),
    #[error("installing {tool}: {message}")]
    ToolInstall { tool: &'static str, message: String },
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: &'static str, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplatingMethod {
    Helm,
    Kustomize,
    Plain,
}

impl TemplatingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplatingMethod::Helm => "helm",
            TemplatingMethod::Kustomize => "kustomize",
            TemplatingMethod::Plain => "plain",
        }
    }
}

/// Helm when a chart is configured, Kustomize when the directory holds a
/// kustomization file, plain YAML otherwise.
pub fn determine_templating_method(input: &KubernetesDeploymentInput, app_dir: &Path) -> TemplatingMethod {
    if input.helm_chart.is_some() {
        return TemplatingMethod::Helm;
    }
    if kustomize::is_kustomization_dir(app_dir) {
        return TemplatingMethod::Kustomize;
    }
    TemplatingMethod::Plain
}

/// Everything needed to render one application for one deploy target.
#[derive(Debug, Clone)]
pub struct LoaderInput {
    pub app_dir: PathBuf,
    pub app_name: String,
    pub commit: String,
    pub config_filename: String,
    pub target_name: String,
    pub input: KubernetesDeploymentInput,
}

type CacheKey = (PathBuf, String, String);

const DEFAULT_CACHE_CAP: usize = 128;

fn manifest_cache_cap() -> usize {
    std::env::var("PIPED_K8S_MANIFEST_CACHE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CACHE_CAP)
}

/// Rendered manifests keyed by (directory, commit, target), evicting the
/// oldest insert once `cap` entries are held.
struct ManifestCache {
    map: FxHashMap<CacheKey, Arc<Vec<Manifest>>>,
    order: VecDeque<CacheKey>,
    cap: usize,
}

impl ManifestCache {
    fn with_capacity(cap: usize) -> Self { Self { map: FxHashMap::default(), order: VecDeque::new(), cap } }

    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<Manifest>>> { self.map.get(key).cloned() }

    fn insert(&mut self, key: CacheKey, value: Arc<Vec<Manifest>>) {
        if self.cap == 0 {
            return;
        }
        if self.map.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
                counter!("manifest_cache_evictions_total", 1u64);
                debug!(dir = %old.0.display(), commit = %old.1, target = %old.2, "manifest cache evicted");
            }
        }
    }
}

/// Renders manifests, caching results per (directory, commit, target).
pub struct Loader {
    tools: Tools,
    cache: Mutex<ManifestCache>,
}

impl Loader {
    /// Loader whose cache holds `PIPED_K8S_MANIFEST_CACHE_CAP` entries (128 by default).
    pub fn new(tools: Tools) -> Self { Self::with_cache_capacity(tools, manifest_cache_cap()) }

    /// Zero disables caching.
    pub fn with_cache_capacity(tools: Tools, cap: usize) -> Self {
        Self { tools, cache: Mutex::new(ManifestCache::with_capacity(cap)) }
    }

    pub fn cached_entries(&self) -> usize { self.cache.lock().map.len() }

    /// Load, apply the namespace override and sort by `pipecd.dev/order`.
    ///
    /// The returned manifests are owned copies; callers may mutate them.
    pub async fn load_manifests(&self, li: &LoaderInput) -> Result<Vec<Manifest>, LoaderError> {
        let key = (li.app_dir.clone(), li.commit.clone(), li.target_name.clone());
        if !li.commit.is_empty() {
            if let Some(hit) = self.cache.lock().get(&key) {
                counter!("manifest_cache_hits_total", 1u64);
                return Ok(hit.as_ref().clone());
            }
        }

        let t0 = Instant::now();
        let input = li.input.for_target(&li.target_name);
        let method = determine_templating_method(&input, &li.app_dir);
        let mut manifests = match method {
            TemplatingMethod::Helm => self.load_helm(li, &input).await?,
            TemplatingMethod::Kustomize => self.load_kustomize(li, &input).await?,
            TemplatingMethod::Plain => load_plain(&li.app_dir, &input.manifests, &li.config_filename)?,
        };
        if !input.namespace.is_empty() {
            for m in manifests.iter_mut() {
                m.set_namespace(&input.namespace)?;
            }
        }
        sort_by_order(&mut manifests);

        let took_ms = t0.elapsed().as_millis() as u64;
        histogram!("manifest_load_latency_ms", took_ms as f64, "method" => method.as_str());
        info!(app = %li.app_name, method = method.as_str(), count = manifests.len(), took_ms, "loaded manifests");

        if !li.commit.is_empty() {
            self.cache.lock().insert(key, Arc::new(manifests.clone()));
        }
        Ok(manifests)
    }

    async fn load_helm(&self, li: &LoaderInput, input: &KubernetesDeploymentInput) -> Result<Vec<Manifest>, LoaderError> {
        let Some(chart) = input.helm_chart.as_ref() else { return Ok(Vec::new()) };
        let helm = self.tools.helm(&input.helm_version).await.map_err(|e| install_err("helm", e))?;
        let args = helm::template_args(&li.app_dir, &li.app_name, &input.namespace, chart, input.helm_options.as_ref())?;
        let out = run_tool("helm", &helm, &args, &li.app_dir).await?;
        Ok(parse_manifests(&out)?)
    }

    async fn load_kustomize(&self, li: &LoaderInput, input: &KubernetesDeploymentInput) -> Result<Vec<Manifest>, LoaderError> {
        let kustomize = self.tools.kustomize(&input.kustomize_version).await.map_err(|e| install_err("kustomize", e))?;
        let helm = if kustomize::needs_helm(&input.kustomize_options) {
            Some(self.tools.helm(&input.helm_version).await.map_err(|e| install_err("helm", e))?)
        } else {
            None
        };
        let args = kustomize::build_args(&input.kustomize_options, helm.as_deref());
        let out = run_tool("kustomize", &kustomize, &args, &li.app_dir).await?;
        Ok(parse_manifests(&out)?)
    }
}

fn install_err(tool: &'static str, e: anyhow::Error) -> LoaderError {
    LoaderError::ToolInstall { tool, message: format!("{:#}", e) }
}

async fn run_tool(tool: &'static str, path: &Path, args: &[String], cwd: &Path) -> Result<String, LoaderError> {
    debug!(tool, args = ?args, cwd = %cwd.display(), "running renderer");
    let output = Command::new(path)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| LoaderError::Io { path: path.display().to_string(), source })?;
    if !output.status.success() {
        counter!("manifest_render_errors_total", 1u64, "tool" => tool);
        return Err(LoaderError::ToolFailed { tool, stderr: String::from_utf8_lossy(&output.stderr).trim().to_string() });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_manifest_file(p: &Path) -> bool {
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml") | Some("json"))
}

/// Listed files in order, or every top-level YAML/JSON file sorted by name
/// except the application config.
pub fn load_plain(app_dir: &Path, files: &[String], config_filename: &str) -> Result<Vec<Manifest>, LoaderError> {
    let io_err = |p: &Path| {
        let path = p.display().to_string();
        move |source| LoaderError::Io { path, source }
    };
    let paths: Vec<PathBuf> = if files.is_empty() {
        let config = if config_filename.is_empty() { pipedk8s_core::DEFAULT_APP_CONFIG_FILENAME } else { config_filename };
        let mut found: Vec<PathBuf> = std::fs::read_dir(app_dir)
            .map_err(io_err(app_dir))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_manifest_file(p))
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(config))
            .collect();
        found.sort();
        found
    } else {
        files.iter().map(|f| app_dir.join(f)).collect()
    };

    let mut out = Vec::new();
    for p in paths {
        let data = std::fs::read_to_string(&p).map_err(io_err(&p))?;
        out.extend(parse_manifests(&data)?);
    }
    Ok(out)
}

/// Stable sort by the integer `pipecd.dev/order` annotation; missing means 0.
pub fn sort_by_order(manifests: &mut [Manifest]) {
    manifests.sort_by_key(|m| m.annotation(labels::ORDER).and_then(|s| s.trim().parse::<i64>().ok()).unwrap_or(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipedk8s_core::ToolRegistry;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: simple\nspec:\n  replicas: 1\n";
    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: simple\n  annotations:\n    pipecd.dev/order: \"-1\"\n";

    struct FixedRegistry(PathBuf);

    #[async_trait::async_trait]
    impl ToolRegistry for FixedRegistry {
        async fn install_tool(&self, _name: &str, _version: &str, _script: &str) -> anyhow::Result<PathBuf> { Ok(self.0.clone()) }
    }

    fn plain_app() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.pipecd.yaml"), "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n").unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("service.yml"), SERVICE).unwrap();
        std::fs::write(dir.path().join("README.md"), "# not a manifest").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/extra.yaml"), DEPLOYMENT.replace("simple", "extra")).unwrap();
        dir
    }

    fn input(dir: &Path, commit: &str, ki: KubernetesDeploymentInput) -> LoaderInput {
        LoaderInput {
            app_dir: dir.to_path_buf(),
            app_name: "simple".into(),
            commit: commit.into(),
            config_filename: String::new(),
            target_name: "cluster".into(),
            input: ki,
        }
    }

    #[test]
    fn plain_loading_is_top_level_sorted_and_skips_config() {
        let dir = plain_app();
        let ms = load_plain(dir.path(), &[], "").unwrap();
        let names: Vec<String> = ms.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(names, vec!["apps:Deployment::simple", ":Service::simple"]);
        let only = load_plain(dir.path(), &["service.yml".to_string()], "").unwrap();
        assert_eq!(only.len(), 1);
        assert!(load_plain(dir.path(), &["missing.yaml".to_string()], "").is_err());
    }

    #[test]
    fn method_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut ki = KubernetesDeploymentInput::default();
        assert_eq!(determine_templating_method(&ki, dir.path()), TemplatingMethod::Plain);
        std::fs::write(dir.path().join("kustomization.yaml"), "resources: []").unwrap();
        assert_eq!(determine_templating_method(&ki, dir.path()), TemplatingMethod::Kustomize);
        ki.helm_chart = Some(Default::default());
        assert_eq!(determine_templating_method(&ki, dir.path()), TemplatingMethod::Helm);
    }

    #[tokio::test]
    async fn namespace_override_order_sort_and_cache() {
        let dir = plain_app();
        let loader = Loader::new(Tools::new(Arc::new(FixedRegistry(PathBuf::from("/nonexistent")))));
        let ki = KubernetesDeploymentInput { namespace: "prod".into(), ..Default::default() };
        let ms = loader.load_manifests(&input(dir.path(), "c1", ki.clone())).await.unwrap();
        assert_eq!(ms[0].kind(), "Service");
        assert!(ms.iter().all(|m| m.namespace() == "prod"));

        // Same commit hits the cache even though the directory changed.
        std::fs::remove_file(dir.path().join("service.yml")).unwrap();
        assert_eq!(loader.load_manifests(&input(dir.path(), "c1", ki.clone())).await.unwrap().len(), 2);
        assert_eq!(loader.load_manifests(&input(dir.path(), "c2", ki.clone())).await.unwrap().len(), 1);
        assert_eq!(loader.load_manifests(&input(dir.path(), "", ki)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_commit_past_capacity() {
        let dir = plain_app();
        let tools = Tools::new(Arc::new(FixedRegistry(PathBuf::from("/nonexistent"))));
        let loader = Loader::with_cache_capacity(tools, 2);
        let ki = KubernetesDeploymentInput::default();
        for commit in ["c1", "c2", "c3"] {
            assert_eq!(loader.load_manifests(&input(dir.path(), commit, ki.clone())).await.unwrap().len(), 2);
        }
        assert_eq!(loader.cached_entries(), 2);

        // c1 was evicted and re-renders from disk; c3 is still served from the cache.
        std::fs::remove_file(dir.path().join("service.yml")).unwrap();
        assert_eq!(loader.load_manifests(&input(dir.path(), "c3", ki.clone())).await.unwrap().len(), 2);
        assert_eq!(loader.load_manifests(&input(dir.path(), "c1", ki.clone())).await.unwrap().len(), 1);
        assert_eq!(loader.cached_entries(), 2);
        // Re-inserting c1 pushed c2 out.
        assert_eq!(loader.load_manifests(&input(dir.path(), "c2", ki)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_capacity_disables_the_cache() {
        let dir = plain_app();
        let tools = Tools::new(Arc::new(FixedRegistry(PathBuf::from("/nonexistent"))));
        let loader = Loader::with_cache_capacity(tools, 0);
        let ki = KubernetesDeploymentInput::default();
        loader.load_manifests(&input(dir.path(), "c1", ki.clone())).await.unwrap();
        assert_eq!(loader.cached_entries(), 0);
        std::fs::remove_file(dir.path().join("service.yml")).unwrap();
        assert_eq!(loader.load_manifests(&input(dir.path(), "c1", ki)).await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helm_output_is_parsed_and_failures_surface_stderr() {
        use std::os::unix::fs::PermissionsExt;
        let tools = tempfile::tempdir().unwrap();
        let script = tools.path().join("helm");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nif [ \"$5\" = \"broken\" ]; then echo 'chart not found' >&2; exit 1; fi\ncat <<'EOF'\n{}EOF\n", DEPLOYMENT),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let loader = Loader::new(Tools::new(Arc::new(FixedRegistry(script))));

        let dir = tempfile::tempdir().unwrap();
        let mut ki = KubernetesDeploymentInput::default();
        ki.helm_chart = Some(pipedk8s_core::config::InputHelmChart { path: "chart".into(), ..Default::default() });
        let ms = loader.load_manifests(&input(dir.path(), "", ki.clone())).await.unwrap();
        assert_eq!(ms.len(), 1);
        assert!(ms[0].is_deployment());

        ki.helm_chart = Some(pipedk8s_core::config::InputHelmChart { path: "broken".into(), ..Default::default() });
        let err = loader.load_manifests(&input(dir.path(), "", ki)).await.unwrap_err().to_string();
        assert_eq!(err, "helm failed: chart not found");
    }
}
