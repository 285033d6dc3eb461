//! Tool registry contract and the binaries this plugin needs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

pub const DEFAULT_KUBECTL_VERSION: &str = "1.32.2";
pub const DEFAULT_HELM_VERSION: &str = "3.16.1";
pub const DEFAULT_KUSTOMIZE_VERSION: &str = "5.4.3";

const KUBECTL_INSTALL_SCRIPT: &str = r#"
cd {{ .TmpDir }}
curl -LO https://dl.k8s.io/release/v{{ .Version }}/bin/{{ .Os }}/{{ .Arch }}/kubectl
mv kubectl {{ .OutPath }}
chmod +x {{ .OutPath }}
"#;

const HELM_INSTALL_SCRIPT: &str = r#"
cd {{ .TmpDir }}
curl -L https://get.helm.sh/helm-v{{ .Version }}-{{ .Os }}-{{ .Arch }}.tar.gz | tar xvz
mv {{ .Os }}-{{ .Arch }}/helm {{ .OutPath }}
"#;

const KUSTOMIZE_INSTALL_SCRIPT: &str = r#"
cd {{ .TmpDir }}
curl -L https://github.com/kubernetes-sigs/kustomize/releases/download/kustomize%2Fv{{ .Version }}/kustomize_v{{ .Version }}_{{ .Os }}_{{ .Arch }}.tar.gz | tar xvz
mv kustomize {{ .OutPath }}
"#;

/// Installs tools on demand and returns their local paths.
///
/// The script is a template over `Name`, `Version`, `OutPath`, `TmpDir`,
/// `Arch` and `Os`; it must leave the binary at `OutPath`.
#[async_trait::async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn install_tool(&self, name: &str, version: &str, script: &str) -> Result<PathBuf>;
}

/// Resolves the three binaries the plugin shells out to.
#[derive(Clone)]
pub struct Tools {
    registry: Arc<dyn ToolRegistry>,
}

impl Tools {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self { Self { registry } }

    pub async fn kubectl(&self, version: &str) -> Result<PathBuf> {
        self.install("kubectl", version, DEFAULT_KUBECTL_VERSION, KUBECTL_INSTALL_SCRIPT).await
    }

    pub async fn helm(&self, version: &str) -> Result<PathBuf> {
        self.install("helm", version, DEFAULT_HELM_VERSION, HELM_INSTALL_SCRIPT).await
    }

    pub async fn kustomize(&self, version: &str) -> Result<PathBuf> {
        self.install("kustomize", version, DEFAULT_KUSTOMIZE_VERSION, KUSTOMIZE_INSTALL_SCRIPT).await
    }

    async fn install(&self, name: &str, version: &str, default_version: &str, script: &str) -> Result<PathBuf> {
        let version = if version.is_empty() { default_version } else { version };
        self.registry
            .install_tool(name, version, script)
            .await
            .with_context(|| format!("installing {} {}", name, version))
    }
}

/// Values substituted into an install script.
#[derive(Debug, Clone)]
pub struct ScriptVars<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub out_path: &'a Path,
    pub tmp_dir: &'a Path,
}

pub fn render_install_script(script: &str, vars: &ScriptVars<'_>) -> String {
    script
        .replace("{{ .Name }}", vars.name)
        .replace("{{ .Version }}", vars.version)
        .replace("{{ .OutPath }}", &vars.out_path.display().to_string())
        .replace("{{ .TmpDir }}", &vars.tmp_dir.display().to_string())
        .replace("{{ .Arch }}", go_arch())
        .replace("{{ .Os }}", go_os())
}

fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

fn go_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Registry that installs into a local directory by running scripts with `sh`.
///
/// `PIPED_K8S_<NAME>_PATH` (e.g. `PIPED_K8S_KUBECTL_PATH`) short-circuits the
/// install for that tool.
#[derive(Debug, Clone)]
pub struct LocalToolRegistry {
    dir: PathBuf,
}

impl LocalToolRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    /// Uses `PIPED_K8S_TOOLS_DIR`, falling back to a directory under the system temp dir.
    pub fn from_env() -> Self {
        let dir = std::env::var("PIPED_K8S_TOOLS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("piped-k8s-tools"));
        Self::new(dir)
    }

    fn env_override(name: &str) -> Option<PathBuf> {
        let var = format!("PIPED_K8S_{}_PATH", name.to_ascii_uppercase());
        std::env::var(var).ok().filter(|s| !s.is_empty()).map(PathBuf::from)
    }
}

#[async_trait::async_trait]
impl ToolRegistry for LocalToolRegistry {
    async fn install_tool(&self, name: &str, version: &str, script: &str) -> Result<PathBuf> {
        if let Some(p) = Self::env_override(name) {
            debug!(tool = %name, path = %p.display(), "using tool path from environment");
            return Ok(p);
        }
        let out_path = self.dir.join(format!("{}-{}", name, version));
        if tokio::fs::metadata(&out_path).await.is_ok() {
            return Ok(out_path);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating tools dir {}", self.dir.display()))?;
        let tmp = tempfile::tempdir().context("creating temp dir for tool install")?;
        let rendered = render_install_script(script, &ScriptVars { name, version, out_path: &out_path, tmp_dir: tmp.path() });
        info!(tool = %name, version = %version, "installing tool");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running install script for {}", name))?;
        if !output.status.success() {
            return Err(anyhow!(
                "install script for {} {} failed: {}",
                name,
                version,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        if tokio::fs::metadata(&out_path).await.is_err() {
            return Err(anyhow!("install script for {} did not produce {}", name, out_path.display()));
        }
        Ok(out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_variables_are_substituted() {
        let vars = ScriptVars { name: "helm", version: "3.16.1", out_path: Path::new("/tools/helm"), tmp_dir: Path::new("/tmp/x") };
        let s = render_install_script(HELM_INSTALL_SCRIPT, &vars);
        assert!(s.contains("cd /tmp/x"));
        assert!(s.contains("helm-v3.16.1-"));
        assert!(s.contains("/helm /tools/helm"));
        assert!(!s.contains("{{"));
    }

    #[tokio::test]
    async fn local_registry_runs_script_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LocalToolRegistry::new(dir.path());
        let script = "printf '#!/bin/sh\\necho {{ .Name }}\\n' > {{ .OutPath }}";
        let p = reg.install_tool("faketool", "1.0.0", script).await.unwrap();
        assert_eq!(p, dir.path().join("faketool-1.0.0"));
        // Second call must not rerun the (now failing) script.
        let again = reg.install_tool("faketool", "1.0.0", "exit 1").await.unwrap();
        assert_eq!(again, p);
    }

    #[tokio::test]
    async fn failing_script_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let reg = LocalToolRegistry::new(dir.path());
        let err = reg.install_tool("broken", "0.0.1", "echo nope >&2; exit 3").await.unwrap_err().to_string();
        assert!(err.contains("nope"), "err={}", err);
    }
}
