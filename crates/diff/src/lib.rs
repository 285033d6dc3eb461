//! piped-k8s diff: structural comparison of manifests and its rendering

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Write as _;

use pipedk8s_core::{Manifest, ResourceKey};
use tracing::debug;

mod normalize;
mod render;
mod unified;
mod walk;

pub use normalize::{canonical_quantity, rebalance_secret, remarshal};
pub use render::{RenderOptions, Renderer, MASKED_VALUE};
pub use unified::unified_diff;
pub use walk::{diff_values, DiffOptions, Node, Nodes, PathStep, ValueKind};

pub const DIFF_HEADER: &str = "--- Actual   (LiveState)\n+++ Expected (Git)\n";

/// Structural diff of two manifests.
///
/// Secrets are rebalanced and both sides are normalized first; if
/// normalization fails the raw bodies are compared.
pub fn diff(old: &Manifest, new: &Manifest, opts: &DiffOptions) -> Nodes {
    let mut x = old.body().clone();
    let y = new.body();
    if old.is_secret() && new.is_secret() {
        rebalance_secret(&mut x, y);
    }
    let (x, y) = match (remarshal(&x), remarshal(y)) {
        (Ok(nx), Ok(ny)) => (nx, ny),
        (Err(e), _) | (_, Err(e)) => {
            debug!(key = %new.key(), error = %e, "remarshal failed; comparing raw manifests");
            (x, y.clone())
        }
    };
    diff_values(&x, &y, opts)
}

#[derive(Debug, Clone)]
pub struct DiffChange {
    pub old: Manifest,
    pub new: Manifest,
    pub diff: Nodes,
}

/// Outcome of comparing two manifest sets keyed by normalized resource key.
#[derive(Debug, Clone, Default)]
pub struct DiffListResult {
    pub adds: Vec<Manifest>,
    pub deletes: Vec<Manifest>,
    pub changes: Vec<DiffChange>,
}

/// Compare `olds` against `news`. Entries are ordered by key; changes only
/// include pairs with a non-empty diff.
pub fn diff_list(olds: &[Manifest], news: &[Manifest], opts: &DiffOptions) -> DiffListResult {
    let index = |ms: &[Manifest]| -> BTreeMap<ResourceKey, Manifest> {
        ms.iter().map(|m| (m.key().normalize(), m.clone())).collect()
    };
    let mut old_map = index(olds);
    let new_map = index(news);

    let mut out = DiffListResult::default();
    for (key, new) in new_map {
        match old_map.remove(&key) {
            None => out.adds.push(new),
            Some(old) => {
                let nodes = diff(&old, &new, opts);
                if nodes.has_diff() {
                    out.changes.push(DiffChange { old, new, diff: nodes });
                }
            }
        }
    }
    out.deletes = old_map.into_values().collect();
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffRenderOptions {
    pub mask_secret: bool,
    pub mask_config_map: bool,
    /// Zero renders every change.
    pub max_changed_manifests: usize,
    /// Render changes as unified line diffs of the YAML documents.
    pub use_diff_command: bool,
}

impl DiffListResult {
    pub fn no_changes(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty() && self.changes.is_empty()
    }

    pub fn total_out_of_sync(&self) -> usize { self.adds.len() + self.deletes.len() + self.changes.len() }

    pub fn render(&self, opts: &DiffRenderOptions) -> String {
        let mut out = String::new();
        let mut index = 0;
        for m in &self.deletes {
            index += 1;
            let _ = write!(out, "- {}. {}\n\n", index, m.key().normalize().readable_string());
        }
        for m in &self.adds {
            index += 1;
            let _ = write!(out, "+ {}. {}\n\n", index, m.key().normalize().readable_string());
        }
        let max = if opts.max_changed_manifests == 0 { self.changes.len() } else { opts.max_changed_manifests };
        for change in self.changes.iter().take(max) {
            index += 1;
            let _ = write!(out, "# {}. {}\n\n", index, change.new.key().normalize().readable_string());
            out.push_str(&render_change(change, opts));
            out.push('\n');
        }
        if self.changes.len() > max {
            let _ = writeln!(out, "... (omitted {} other changed manifests)", self.changes.len() - max);
        }
        out
    }
}

fn render_change(change: &DiffChange, opts: &DiffRenderOptions) -> String {
    let masked = (opts.mask_secret && change.new.is_secret()) || (opts.mask_config_map && change.new.is_config_map());
    if opts.use_diff_command && !masked {
        if let (Ok(old), Ok(new)) = (change.old.to_yaml(), change.new.to_yaml()) {
            return format!("{}{}", DIFF_HEADER, unified_diff(&old, &new));
        }
    }
    let ro = RenderOptions { mask_path_prefix: masked.then(|| "data".to_string()) };
    Renderer::new(ro).render(&change.diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipedk8s_core::parse_manifests;

    fn one(yaml: &str) -> Manifest {
        parse_manifests(yaml).unwrap().remove(0)
    }

    fn deployment(replicas: u32, image: &str) -> Manifest {
        one(&format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: simple\nspec:\n  replicas: {}\n  selector:\n    matchLabels:\n      app: simple\n  template:\n    metadata:\n      labels:\n        app: simple\n    spec:\n      containers:\n      - name: nginx\n        image: {}\n",
            replicas, image
        ))
    }

    #[test]
    fn secret_with_mixed_data_and_string_data_has_no_diff() {
        let live = one("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\ndata:\n  user: YWRtaW4=\n  pass: c2VjcmV0\n");
        let desired = one("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\ndata:\n  user: YWRtaW4=\nstringData:\n  pass: secret\n");
        let nodes = diff(&live, &desired, &DiffOptions::default());
        assert!(!nodes.has_diff(), "nodes={:?}", nodes);
    }

    #[test]
    fn equivalent_quantities_have_no_diff() {
        let mk = |mem: &str| {
            one(&format!(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: q\nspec:\n  selector: {{}}\n  template:\n    spec:\n      containers:\n      - name: c\n        resources:\n          requests:\n            memory: {}\n",
                mem
            ))
        };
        assert!(!diff(&mk("2Gi"), &mk("2048Mi"), &DiffOptions::default()).has_diff());
        assert!(diff(&mk("2Gi"), &mk("1Gi"), &DiffOptions::default()).has_diff());
    }

    #[test]
    fn list_diff_groups_by_normalized_key() {
        let svc_default = one("apiVersion: v1\nkind: Service\nmetadata:\n  name: simple\n  namespace: default\nspec:\n  ports:\n  - port: 80\n");
        let svc_implicit = one("apiVersion: v1\nkind: Service\nmetadata:\n  name: simple\nspec:\n  ports:\n  - port: 80\n");
        let cm = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: b\n");
        let res = diff_list(&[svc_default, deployment(1, "nginx:1.19")], &[svc_implicit, cm, deployment(3, "nginx:1.19")], &DiffOptions::default().with_ignore_adding_map_keys());
        assert_eq!(res.adds.len(), 1);
        assert!(res.adds[0].is_config_map());
        assert!(res.deletes.is_empty());
        assert_eq!(res.changes.len(), 1);
        assert!(res.changes[0].new.is_deployment());
        assert!(!res.no_changes());
        assert_eq!(res.total_out_of_sync(), 2);
    }

    #[test]
    fn render_lists_deletes_adds_and_changes() {
        let cm = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: b\n");
        let res = diff_list(&[deployment(1, "nginx:1.19"), cm], &[deployment(3, "nginx:1.20")], &DiffOptions::default());
        let out = res.render(&DiffRenderOptions::default());
        assert!(out.starts_with("- 1. name=\"cfg\", kind=\"ConfigMap\", namespace=\"default\", apiGroup=\"\"\n\n"), "out={}", out);
        assert!(out.contains("# 2. name=\"simple\", kind=\"Deployment\""));
        assert!(out.contains("-   replicas: 1\n+   replicas: 3\n"));
        assert!(out.contains("-           image: nginx:1.19\n+           image: nginx:1.20\n"));
    }

    #[test]
    fn render_truncates_changes() {
        let a1 = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: '1'\n");
        let a2 = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: '2'\n");
        let b1 = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\ndata:\n  k: '1'\n");
        let b2 = one("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\ndata:\n  k: '2'\n");
        let res = diff_list(&[a1, b1], &[a2, b2], &DiffOptions::default());
        let out = res.render(&DiffRenderOptions { max_changed_manifests: 1, mask_config_map: true, ..Default::default() });
        assert!(out.contains("# 1. name=\"a\""));
        assert!(!out.contains("# 2."));
        assert!(out.ends_with("... (omitted 1 other changed manifests)\n"));
        assert!(out.contains("-   k: *****"), "out={}", out);
    }

    #[test]
    fn unified_mode_has_header() {
        let res = diff_list(&[deployment(1, "nginx:1.19")], &[deployment(3, "nginx:1.19")], &DiffOptions::default());
        let out = res.render(&DiffRenderOptions { use_diff_command: true, ..Default::default() });
        assert!(out.contains("--- Actual   (LiveState)\n+++ Expected (Git)\n@@"), "out={}", out);
        assert!(out.contains("-  replicas: 1\n+  replicas: 3\n"), "out={}", out);
    }
}
