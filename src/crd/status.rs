//! # LlamaStackDistribution Status
//!
//! Status types written by the status state machine at the end of each reconcile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Coarse lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub enum DistributionPhase {
    /// Workload object not yet observed
    #[default]
    Pending,
    /// Workload observed, ready replicas differ from desired
    Initializing,
    /// Ready replicas equal desired
    Ready,
    /// The reconcile itself errored
    Failed,
}

impl DistributionPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionPhase::Pending => "Pending",
            DistributionPhase::Initializing => "Initializing",
            DistributionPhase::Ready => "Ready",
            DistributionPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for DistributionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the LlamaStackDistribution resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LlamaStackDistributionStatus {
    #[serde(default)]
    pub phase: DistributionPhase,
    /// Conditions are recomputed on every reconcile
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Ready replicas observed on the managed Deployment
    #[serde(default)]
    pub available_replicas: i32,
    /// Cluster-internal URL of the server
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub distribution_config: DistributionConfigStatus,
    #[serde(default)]
    pub version: VersionInfo,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistributionConfigStatus {
    /// Resolved distribution (catalog name or image)
    #[serde(default)]
    pub active_distribution: Option<String>,
    /// Catalog with operator-level image overrides applied
    #[serde(default)]
    pub available_distributions: BTreeMap<String, String>,
    /// Providers reported by the running server
    #[serde(default)]
    pub providers: Vec<ProviderInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub api: String,
    pub provider_id: String,
    pub provider_type: String,
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub health: Option<ProviderHealthStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub operator_version: Option<String>,
    /// Reported by the server's version endpoint; kept across failed probes
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

impl LlamaStackDistributionStatus {
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_as_plain_string() {
        let value = serde_json::to_value(DistributionPhase::Initializing).unwrap();
        assert_eq!(value, serde_json::json!("Initializing"));
    }

    #[test]
    fn test_status_roundtrip_keeps_camel_case() {
        let status = LlamaStackDistributionStatus {
            phase: DistributionPhase::Ready,
            available_replicas: 2,
            service_url: Some("http://x.ns.svc.cluster.local:8321".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["availableReplicas"], 2);
        assert_eq!(value["serviceUrl"], "http://x.ns.svc.cluster.local:8321");
        assert_eq!(value["phase"], "Ready");
    }
}
