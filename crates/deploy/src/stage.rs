//! Stage names handled by the plugin.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Sync,
    PrimaryRollout,
    CanaryRollout,
    CanaryClean,
    BaselineRollout,
    BaselineClean,
    TrafficRouting,
    Rollback,
}

impl StageName {
    pub const ALL: [StageName; 8] = [
        StageName::Sync,
        StageName::PrimaryRollout,
        StageName::CanaryRollout,
        StageName::CanaryClean,
        StageName::BaselineRollout,
        StageName::BaselineClean,
        StageName::TrafficRouting,
        StageName::Rollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Sync => "K8S_SYNC",
            StageName::PrimaryRollout => "K8S_PRIMARY_ROLLOUT",
            StageName::CanaryRollout => "K8S_CANARY_ROLLOUT",
            StageName::CanaryClean => "K8S_CANARY_CLEAN",
            StageName::BaselineRollout => "K8S_BASELINE_ROLLOUT",
            StageName::BaselineClean => "K8S_BASELINE_CLEAN",
            StageName::TrafficRouting => "K8S_TRAFFIC_ROUTING",
            StageName::Rollback => "K8S_ROLLBACK",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageName::Sync => "Sync by applying all manifests",
            StageName::PrimaryRollout => "Roll out the new version as the primary variant",
            StageName::CanaryRollout => "Roll out the new version as the canary variant",
            StageName::CanaryClean => "Remove all canary resources",
            StageName::BaselineRollout => "Roll out the running version as the baseline variant",
            StageName::BaselineClean => "Remove all baseline resources",
            StageName::TrafficRouting => "Change the traffic routing between variants",
            StageName::Rollback => "Rollback the deployment",
        }
    }

    /// Every stage name, as reported by `FetchDefinedStages`.
    pub fn defined() -> Vec<String> { Self::ALL.iter().map(|s| s.as_str().to_string()).collect() }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported stage {0}")]
pub struct UnknownStage(pub String);

impl FromStr for StageName {
    type Err = UnknownStage;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.iter().copied().find(|n| n.as_str() == s).ok_or_else(|| UnknownStage(s.to_string()))
    }
}
