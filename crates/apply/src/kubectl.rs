//! `kubectl` as a capability, plus the subprocess implementation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use pipedk8s_core::{parse_manifests, Manifest, ManifestError, ResourceKey};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum KubectlError {
    #[error("resource not found")]
    NotFound,
    #[error("resource to replace was not found")]
    ReplaceNotFound,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("running kubectl: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl KubectlError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubectlError::NotFound | KubectlError::ReplaceNotFound)
    }
}

pub type KubectlResult<T> = Result<T, KubectlError>;

/// Cluster operations the plugin needs, keyed by kubeconfig path.
///
/// An empty `namespace` means "whatever the manifest or kubeconfig says";
/// for `get_all` it means every namespace.
#[async_trait]
pub trait KubectlOps: Send + Sync {
    async fn apply(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest, server_side: bool) -> KubectlResult<()>;
    async fn create(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()>;
    async fn replace(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()>;
    async fn force_replace(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()>;
    async fn delete(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<()>;
    async fn get(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<Manifest>;
    async fn create_namespace(&self, kubeconfig: &str, namespace: &str) -> KubectlResult<()>;
    /// Namespaced resources matching every selector.
    async fn get_all(&self, kubeconfig: &str, namespace: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>>;
    async fn get_all_cluster_scoped(&self, kubeconfig: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>>;
}

/// Shells out to a `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCli {
    path: PathBuf,
}

impl KubectlCli {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn args(kubeconfig: &str, namespace: &str, rest: &[&str]) -> Vec<String> {
        let mut out = Vec::with_capacity(rest.len() + 4);
        if !kubeconfig.is_empty() {
            out.push("--kubeconfig".to_string());
            out.push(kubeconfig.to_string());
        }
        if !namespace.is_empty() {
            out.push("--namespace".to_string());
            out.push(namespace.to_string());
        }
        out.extend(rest.iter().map(|s| s.to_string()));
        out
    }

    async fn run(&self, op: &'static str, args: Vec<String>, stdin: Option<String>) -> KubectlResult<Vec<u8>> {
        let t0 = Instant::now();
        debug!(op, args = ?args, "running kubectl");
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(input) = stdin {
            if let Some(mut w) = child.stdin.take() {
                w.write_all(input.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;
        histogram!("kubectl_command_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if output.status.success() {
            counter!("kubectl_commands_total", 1u64, "op" => op, "result" => "ok");
            return Ok(output.stdout);
        }
        counter!("kubectl_commands_total", 1u64, "op" => op, "result" => "error");
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(op, stderr))
    }

    async fn write(&self, op: &'static str, kubeconfig: &str, namespace: &str, rest: &[&str], manifest: &Manifest) -> KubectlResult<()> {
        let yaml = manifest.to_yaml()?;
        self.run(op, Self::args(kubeconfig, namespace, rest), Some(yaml)).await.map(|_| ())
    }

    async fn list_resource_names(&self, kubeconfig: &str, namespaced: bool) -> KubectlResult<Vec<String>> {
        let flag = if namespaced { "--namespaced=true" } else { "--namespaced=false" };
        let out = self
            .run("api-resources", Self::args(kubeconfig, "", &["api-resources", flag, "--verbs=list,delete", "-o", "name"]), None)
            .await?;
        Ok(String::from_utf8_lossy(&out).lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn get_by_selector(&self, kubeconfig: &str, namespace: Option<&str>, namespaced: bool, selector: &[String]) -> KubectlResult<Vec<Manifest>> {
        let resources = self.list_resource_names(kubeconfig, namespaced).await?;
        if resources.is_empty() {
            return Ok(Vec::new());
        }
        let joined = resources.join(",");
        let sel = selector.join(",");
        let mut rest = vec!["get", joined.as_str(), "-o", "yaml", "--selector", sel.as_str()];
        let ns = match namespace {
            Some("") => {
                rest.push("--all-namespaces");
                ""
            }
            Some(ns) => ns,
            None => "",
        };
        let out = self.run("get-all", Self::args(kubeconfig, ns, &rest), None).await?;
        Ok(parse_manifests(&String::from_utf8_lossy(&out))?)
    }
}

fn classify(op: &'static str, stderr: String) -> KubectlError {
    if stderr.contains("(NotFound)") {
        return if op == "replace" || op == "force-replace" { KubectlError::ReplaceNotFound } else { KubectlError::NotFound };
    }
    if stderr.contains("(AlreadyExists)") {
        return KubectlError::AlreadyExists;
    }
    KubectlError::CommandFailed { command: format!("kubectl {}", op), stderr }
}

#[async_trait]
impl KubectlOps for KubectlCli {
    async fn apply(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest, server_side: bool) -> KubectlResult<()> {
        if server_side {
            self.write("apply", kubeconfig, namespace, &["apply", "--server-side", "-f", "-"], manifest).await
        } else {
            self.write("apply", kubeconfig, namespace, &["apply", "-f", "-"], manifest).await
        }
    }

    async fn create(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        self.write("create", kubeconfig, namespace, &["create", "-f", "-"], manifest).await
    }

    async fn replace(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        self.write("replace", kubeconfig, namespace, &["replace", "-f", "-"], manifest).await
    }

    async fn force_replace(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> KubectlResult<()> {
        self.write("force-replace", kubeconfig, namespace, &["replace", "--force", "-f", "-"], manifest).await
    }

    async fn delete(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<()> {
        let kind = key.group_kind();
        self.run("delete", Self::args(kubeconfig, namespace, &["delete", &kind, key.name()]), None).await.map(|_| ())
    }

    async fn get(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> KubectlResult<Manifest> {
        let kind = key.group_kind();
        let out = self.run("get", Self::args(kubeconfig, namespace, &["get", &kind, key.name(), "-o", "yaml"]), None).await?;
        parse_manifests(&String::from_utf8_lossy(&out))?.into_iter().next().ok_or(KubectlError::NotFound)
    }

    async fn create_namespace(&self, kubeconfig: &str, namespace: &str) -> KubectlResult<()> {
        self.run("create-namespace", Self::args(kubeconfig, "", &["create", "namespace", namespace]), None)
            .await
            .map(|_| ())
    }

    async fn get_all(&self, kubeconfig: &str, namespace: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>> {
        self.get_by_selector(kubeconfig, Some(namespace), true, selector).await
    }

    async fn get_all_cluster_scoped(&self, kubeconfig: &str, selector: &[String]) -> KubectlResult<Vec<Manifest>> {
        self.get_by_selector(kubeconfig, None, false, selector).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_kubeconfig_and_namespace_only_when_set() {
        assert_eq!(KubectlCli::args("", "", &["apply", "-f", "-"]), vec!["apply", "-f", "-"]);
        assert_eq!(
            KubectlCli::args("/k", "ns", &["get"]),
            vec!["--kubeconfig", "/k", "--namespace", "ns", "get"]
        );
    }

    #[test]
    fn stderr_markers_map_to_error_kinds() {
        let nf = "Error from server (NotFound): deployments.apps \"x\" not found".to_string();
        assert!(matches!(classify("get", nf.clone()), KubectlError::NotFound));
        assert!(matches!(classify("replace", nf), KubectlError::ReplaceNotFound));
        let ae = "Error from server (AlreadyExists): namespaces \"x\" already exists".to_string();
        assert!(matches!(classify("create-namespace", ae), KubectlError::AlreadyExists));
        let other = classify("apply", "boom".into());
        assert_eq!(other.to_string(), "kubectl apply failed: boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_feeds_manifest_on_stdin_and_surfaces_stderr() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let stdin_copy = dir.path().join("stdin.yaml");
        let script = dir.path().join("kubectl");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > {}\nif [ \"$1\" = \"replace\" ]; then echo 'Error from server (NotFound): x' >&2; exit 1; fi\n",
                stdin_copy.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cli = KubectlCli::new(&script);
        let m = parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n").unwrap().remove(0);
        cli.apply("", "", &m, false).await.unwrap();
        let written = std::fs::read_to_string(&stdin_copy).unwrap();
        assert!(written.contains("name: cfg"));
        let err = cli.replace("", "", &m).await.unwrap_err();
        assert!(matches!(err, KubectlError::ReplaceNotFound));
    }
}
