//! Application configuration and per-stage options.
//!
//! Every struct carries serde defaults so handlers always see a fully
//! populated value, whatever subset the user wrote.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::labels;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parsing application config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("parsing stage options: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reading {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level `app.pipecd.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub api_version: String,
    pub kind: String,
    pub spec: KubernetesApplicationSpec,
}

impl ApplicationConfig {
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesApplicationSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub input: KubernetesDeploymentInput,
    pub quick_sync: K8sSyncStageOptions,
    pub pipeline: Option<DeploymentPipeline>,
    pub planner: DeploymentPlanner,
    pub auto_rollback: bool,
    pub variant_label: KubernetesVariantLabel,
    pub workloads: Vec<K8sResourceReference>,
    pub service: K8sResourceReference,
    pub traffic_routing: Option<KubernetesTrafficRouting>,
}

impl Default for KubernetesApplicationSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            labels: BTreeMap::new(),
            input: KubernetesDeploymentInput::default(),
            quick_sync: K8sSyncStageOptions::default(),
            pipeline: None,
            planner: DeploymentPlanner::default(),
            auto_rollback: true,
            variant_label: KubernetesVariantLabel::default(),
            workloads: Vec::new(),
            service: K8sResourceReference::default(),
            traffic_routing: None,
        }
    }
}

impl KubernetesApplicationSpec {
    pub fn traffic_routing_method(&self) -> TrafficRoutingMethod {
        self.traffic_routing.as_ref().map(|t| t.method).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeploymentPlanner {
    pub always_use_pipeline: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeploymentPipeline {
    pub stages: Vec<PipelineStageConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineStageConfig {
    pub id: String,
    pub name: String,
    pub desc: String,
    pub timeout: String,
    /// Stage-specific options, handed to the executor as JSON bytes.
    pub with: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesDeploymentInput {
    /// Manifest file names relative to the application directory.
    pub manifests: Vec<String>,
    pub kubectl_version: String,
    pub kustomize_version: String,
    pub kustomize_options: BTreeMap<String, String>,
    pub helm_version: String,
    pub helm_chart: Option<InputHelmChart>,
    pub helm_options: Option<InputHelmOptions>,
    /// Overrides the namespace of every manifest when non-empty.
    pub namespace: String,
    pub auto_create_namespace: bool,
    pub multi_targets: Vec<KubernetesMultiTarget>,
}

impl KubernetesDeploymentInput {
    /// Input with the `multiTargets` entry for `target` folded in.
    pub fn for_target(&self, target: &str) -> KubernetesDeploymentInput {
        let mut out = self.clone();
        let Some(mt) = self.multi_targets.iter().find(|m| m.target.name == target) else { return out };
        if !mt.manifests.is_empty() { out.manifests = mt.manifests.clone(); }
        if !mt.kubectl_version.is_empty() { out.kubectl_version = mt.kubectl_version.clone(); }
        if !mt.kustomize_version.is_empty() { out.kustomize_version = mt.kustomize_version.clone(); }
        if !mt.kustomize_options.is_empty() { out.kustomize_options = mt.kustomize_options.clone(); }
        if !mt.helm_version.is_empty() { out.helm_version = mt.helm_version.clone(); }
        if mt.helm_chart.is_some() { out.helm_chart = mt.helm_chart.clone(); }
        if mt.helm_options.is_some() { out.helm_options = mt.helm_options.clone(); }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesMultiTarget {
    pub target: MultiTargetRef,
    pub manifests: Vec<String>,
    pub kubectl_version: String,
    pub kustomize_version: String,
    pub kustomize_options: BTreeMap<String, String>,
    pub helm_version: String,
    pub helm_chart: Option<InputHelmChart>,
    pub helm_options: Option<InputHelmOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiTargetRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InputHelmChart {
    pub git_remote: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub path: String,
    pub repository: String,
    pub name: String,
    pub version: String,
}

/// Where a chart comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelmChartSource<'a> {
    Local { path: &'a str },
    Git { remote: &'a str, reference: &'a str, path: &'a str },
    Repository { repository: &'a str, name: &'a str, version: &'a str },
}

impl InputHelmChart {
    pub fn source(&self) -> Result<HelmChartSource<'_>, ConfigError> {
        if !self.git_remote.is_empty() {
            return Ok(HelmChartSource::Git { remote: &self.git_remote, reference: &self.reference, path: &self.path });
        }
        if !self.repository.is_empty() {
            if self.name.is_empty() {
                return Err(ConfigError::Invalid("helmChart.name is required for a repository chart".into()));
            }
            return Ok(HelmChartSource::Repository { repository: &self.repository, name: &self.name, version: &self.version });
        }
        if !self.path.is_empty() {
            return Ok(HelmChartSource::Local { path: &self.path });
        }
        Err(ConfigError::Invalid("helmChart needs one of path, gitRemote or repository".into()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InputHelmOptions {
    pub release_name: String,
    pub set_values: BTreeMap<String, String>,
    pub value_files: Vec<String>,
    pub set_files: BTreeMap<String, String>,
    pub api_versions: Vec<String>,
    pub kube_version: String,
}

/// `quickSync` block; also the K8S_SYNC stage options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sSyncStageOptions {
    pub add_variant_label_to_selector: bool,
    pub prune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesVariantLabel {
    pub key: String,
    pub primary_value: String,
    pub canary_value: String,
    pub baseline_value: String,
}

impl Default for KubernetesVariantLabel {
    fn default() -> Self {
        Self {
            key: labels::DEFAULT_VARIANT_LABEL.to_string(),
            primary_value: labels::DEFAULT_PRIMARY_VARIANT.to_string(),
            canary_value: labels::DEFAULT_CANARY_VARIANT.to_string(),
            baseline_value: labels::DEFAULT_BASELINE_VARIANT.to_string(),
        }
    }
}

/// Reference to manifests by kind and optional name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sResourceReference {
    pub kind: String,
    pub name: String,
}

impl K8sResourceReference {
    pub fn kind_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.kind.is_empty() { default } else { &self.kind }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficRoutingMethod {
    #[default]
    #[serde(rename = "podselector")]
    PodSelector,
    #[serde(rename = "istio")]
    Istio,
}

impl fmt::Display for TrafficRoutingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficRoutingMethod::PodSelector => f.write_str("podselector"),
            TrafficRoutingMethod::Istio => f.write_str("istio"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesTrafficRouting {
    pub method: TrafficRoutingMethod,
    pub istio: Option<IstioTrafficRouting>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IstioTrafficRouting {
    pub edit_virtual_service_routes: Vec<String>,
    pub host: String,
    pub virtual_service: K8sResourceReference,
}

// ---- stage options ----

/// Parse a stage's JSON options; empty input yields the defaults.
pub fn parse_stage_options<T: DeserializeOwned + Default>(raw: &[u8]) -> Result<T, ConfigError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(raw)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sPrimaryRolloutStageOptions {
    pub suffix: String,
    pub create_service: bool,
    pub add_variant_label_to_selector: bool,
    pub prune: bool,
}

impl Default for K8sPrimaryRolloutStageOptions {
    fn default() -> Self {
        Self {
            suffix: labels::DEFAULT_PRIMARY_VARIANT.to_string(),
            create_service: false,
            add_variant_label_to_selector: false,
            prune: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sCanaryRolloutStageOptions {
    pub replicas: Replicas,
    pub suffix: String,
    pub create_service: bool,
    pub patches: Vec<K8sResourcePatch>,
}

impl Default for K8sCanaryRolloutStageOptions {
    fn default() -> Self {
        Self {
            replicas: Replicas::count(1),
            suffix: labels::DEFAULT_CANARY_VARIANT.to_string(),
            create_service: false,
            patches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sResourcePatch {
    pub target: K8sResourcePatchTarget,
    pub ops: Vec<K8sResourcePatchOp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sResourcePatchTarget {
    pub kind: String,
    pub name: String,
    pub document_root: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sResourcePatchOp {
    pub op: String,
    pub path: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sBaselineRolloutStageOptions {
    pub replicas: Replicas,
    pub suffix: String,
    pub create_service: bool,
}

impl Default for K8sBaselineRolloutStageOptions {
    fn default() -> Self {
        Self { replicas: Replicas::count(1), suffix: labels::DEFAULT_BASELINE_VARIANT.to_string(), create_service: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sTrafficRoutingStageOptions {
    /// `primary`, `canary` or `baseline`; wins over the percentages.
    pub all: String,
    pub primary: Percentage,
    pub canary: Percentage,
    pub baseline: Percentage,
}

impl K8sTrafficRoutingStageOptions {
    /// `(primary, canary, baseline)` percentages.
    pub fn percentages(&self) -> (u32, u32, u32) {
        match self.all.as_str() {
            "primary" => (100, 0, 0),
            "canary" => (0, 100, 0),
            "baseline" => (0, 0, 100),
            _ => (self.primary.number, self.canary.number, self.baseline.number),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

/// Replica count given either as an absolute number or as `"N%"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrString", into = "String")]
pub struct Replicas {
    pub number: u32,
    pub is_percentage: bool,
}

impl Replicas {
    pub const fn count(number: u32) -> Self { Self { number, is_percentage: false } }

    /// Resolve against `total`; zero configured replicas fall back to `default_value`.
    pub fn calculate(&self, total: u32, default_value: u32) -> u32 {
        if self.number == 0 {
            return default_value;
        }
        if !self.is_percentage {
            return self.number;
        }
        let n = (u64::from(self.number) * u64::from(total)).div_ceil(100);
        n as u32
    }
}

impl TryFrom<NumberOrString> for Replicas {
    type Error = String;
    fn try_from(v: NumberOrString) -> Result<Self, Self::Error> {
        let (number, is_percentage) = parse_number_or_percent(v)?;
        Ok(Self { number, is_percentage })
    }
}

impl From<Replicas> for String {
    fn from(r: Replicas) -> Self {
        if r.is_percentage { format!("{}%", r.number) } else { r.number.to_string() }
    }
}

/// Traffic weight given as a number or `"N%"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrString", into = "u32")]
pub struct Percentage {
    pub number: u32,
}

impl TryFrom<NumberOrString> for Percentage {
    type Error = String;
    fn try_from(v: NumberOrString) -> Result<Self, Self::Error> {
        let (number, _) = parse_number_or_percent(v)?;
        if number > 100 {
            return Err(format!("percentage must be in [0, 100], got {}", number));
        }
        Ok(Self { number })
    }
}

impl From<Percentage> for u32 {
    fn from(p: Percentage) -> Self { p.number }
}

fn parse_number_or_percent(v: NumberOrString) -> Result<(u32, bool), String> {
    match v {
        NumberOrString::Number(n) => u32::try_from(n).map(|n| (n, false)).map_err(|_| format!("invalid number {}", n)),
        NumberOrString::String(s) => {
            let s = s.trim();
            let (digits, pct) = match s.strip_suffix('%') {
                Some(d) => (d.trim(), true),
                None => (s, false),
            };
            digits.parse::<u32>().map(|n| (n, pct)).map_err(|_| format!("invalid number {:?}", s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_gets_defaults() {
        let cfg = ApplicationConfig::from_yaml("apiVersion: pipecd.dev/v1beta1\nkind: Application\nspec:\n  name: simple\n").unwrap();
        assert_eq!(cfg.spec.name, "simple");
        assert_eq!(cfg.spec.variant_label.key, "pipecd.dev/variant");
        assert_eq!(cfg.spec.variant_label.baseline_value, "baseline");
        assert!(cfg.spec.auto_rollback);
        assert_eq!(cfg.spec.traffic_routing_method(), TrafficRoutingMethod::PodSelector);
    }

    #[test]
    fn unknown_routing_method_is_rejected() {
        let err = ApplicationConfig::from_yaml("spec:\n  trafficRouting:\n    method: smi\n");
        assert!(err.is_err());
    }

    #[test]
    fn stage_options_default_when_empty() {
        let p: K8sPrimaryRolloutStageOptions = parse_stage_options(b"").unwrap();
        assert_eq!(p.suffix, "primary");
        let b: K8sBaselineRolloutStageOptions = parse_stage_options(br#"{"createService":true}"#).unwrap();
        assert!(b.create_service);
        assert_eq!(b.suffix, "baseline");
        assert_eq!(b.replicas, Replicas::count(1));
    }

    #[test]
    fn replicas_accept_number_and_percentage() {
        let b: K8sBaselineRolloutStageOptions = parse_stage_options(br#"{"replicas":"20%"}"#).unwrap();
        assert!(b.replicas.is_percentage);
        assert_eq!(b.replicas.calculate(10, 1), 2);
        assert_eq!(b.replicas.calculate(3, 1), 1);
        let c: K8sCanaryRolloutStageOptions = parse_stage_options(br#"{"replicas":3}"#).unwrap();
        assert_eq!(c.replicas.calculate(10, 1), 3);
        assert_eq!(Replicas::default().calculate(10, 1), 1);
    }

    #[test]
    fn traffic_percentages() {
        let t: K8sTrafficRoutingStageOptions = parse_stage_options(br#"{"all":"canary"}"#).unwrap();
        assert_eq!(t.percentages(), (0, 100, 0));
        let t: K8sTrafficRoutingStageOptions = parse_stage_options(br#"{"primary":50,"canary":"50%"}"#).unwrap();
        assert_eq!(t.percentages(), (50, 50, 0));
        assert!(parse_stage_options::<K8sTrafficRoutingStageOptions>(br#"{"primary":150}"#).is_err());
    }

    #[test]
    fn multi_target_overrides_input() {
        let input: KubernetesDeploymentInput = serde_yaml::from_str(
            "manifests: [a.yaml]\nkubectlVersion: 1.30.0\nmultiTargets:\n- target:\n    name: cluster-b\n  manifests: [b.yaml]\n",
        )
        .unwrap();
        assert_eq!(input.for_target("cluster-b").manifests, vec!["b.yaml".to_string()]);
        assert_eq!(input.for_target("cluster-b").kubectl_version, "1.30.0");
        assert_eq!(input.for_target("cluster-a").manifests, vec!["a.yaml".to_string()]);
    }

    #[test]
    fn helm_chart_source_selection() {
        let local = InputHelmChart { path: "chart".into(), ..Default::default() };
        assert_eq!(local.source().unwrap(), HelmChartSource::Local { path: "chart" });
        let repo = InputHelmChart { repository: "pipecd".into(), name: "helloworld".into(), version: "v0.1.0".into(), ..Default::default() };
        assert!(matches!(repo.source().unwrap(), HelmChartSource::Repository { .. }));
        assert!(InputHelmChart::default().source().is_err());
    }
}
