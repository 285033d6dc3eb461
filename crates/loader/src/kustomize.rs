//! `kustomize build` invocation.

use std::collections::BTreeMap;
use std::path::Path;

const ENABLE_HELM: &str = "enable-helm";

/// Arguments for `kustomize build`, run from the application directory.
///
/// Options become `--key=value` (or `--key` when the value is empty); with
/// `enable-helm` set the resolved helm binary is passed along.
pub fn build_args(options: &BTreeMap<String, String>, helm_path: Option<&Path>) -> Vec<String> {
    let mut args = vec!["build".to_string(), ".".to_string()];
    for (k, v) in options {
        if v.is_empty() {
            args.push(format!("--{}", k));
        } else {
            args.push(format!("--{}={}", k, v));
        }
    }
    if let Some(helm) = helm_path {
        if options.contains_key(ENABLE_HELM) {
            args.push("--helm-command".to_string());
            args.push(helm.display().to_string());
        }
    }
    args
}

pub fn needs_helm(options: &BTreeMap<String, String>) -> bool { options.contains_key(ENABLE_HELM) }

pub fn is_kustomization_dir(dir: &Path) -> bool {
    ["kustomization.yaml", "kustomization.yml", "Kustomization"].iter().any(|f| dir.join(f).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_rendered_as_flags() {
        let mut opts = BTreeMap::new();
        opts.insert("load-restrictor".to_string(), "LoadRestrictionsNone".to_string());
        opts.insert("enable-helm".to_string(), String::new());
        let args = build_args(&opts, Some(Path::new("/tools/helm-3.16.1")));
        assert_eq!(
            args,
            vec!["build", ".", "--enable-helm", "--load-restrictor=LoadRestrictionsNone", "--helm-command", "/tools/helm-3.16.1"]
        );
        assert!(needs_helm(&opts));
        assert_eq!(build_args(&BTreeMap::new(), None), vec!["build", "."]);
    }

    #[test]
    fn detects_kustomization_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_kustomization_dir(dir.path()));
        std::fs::write(dir.path().join("kustomization.yml"), "resources: []").unwrap();
        assert!(is_kustomization_dir(dir.path()));
    }
}
