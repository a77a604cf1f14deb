//! # LlamaStackDistribution Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{
    DEFAULT_CA_BUNDLE_KEY, DEFAULT_CONTAINER_NAME, DEFAULT_MOUNT_PATH, DEFAULT_SERVER_PORT,
    DEFAULT_STORAGE_SIZE,
};

/// LlamaStackDistribution Custom Resource Definition
///
/// Declares a Llama Stack server deployment. The operator renders the
/// Deployment, Service, storage and policy objects from it and reports the
/// observed state back through the status subresource.
///
/// # Example
///
/// ```yaml
/// apiVersion: llamastack.io/v1alpha1
/// kind: LlamaStackDistribution
/// metadata:
///   name: my-stack
///   namespace: default
/// spec:
///   replicas: 1
///   server:
///     distribution:
///       name: starter
///     storage:
///       size: 20Gi
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "LlamaStackDistribution",
    group = "llamastack.io",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::LlamaStackDistributionStatus",
    shortname = "llsd",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Ready", "type":"integer", "jsonPath":".status.availableReplicas"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LlamaStackDistributionSpec {
    /// Desired replica count. Ignored by the rendered Deployment when autoscaling is configured.
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Server configuration
    pub server: ServerSpec,
    /// Network exposure and access policy
    #[serde(default)]
    pub network: Option<NetworkSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Which server build to run: a catalog entry or a direct image reference
    pub distribution: DistributionType,
    #[serde(default)]
    pub container_spec: Option<ContainerSpec>,
    #[serde(default)]
    pub pod_overrides: Option<PodOverrides>,
    /// Persistent storage. When absent the server uses an emptyDir volume.
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    #[serde(default)]
    pub user_config: Option<UserConfigSpec>,
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
    #[serde(default)]
    pub autoscaling: Option<AutoscalingSpec>,
    #[serde(default)]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,
    #[serde(default)]
    pub topology_spread_constraints: Option<Vec<TopologySpreadConstraintSpec>>,
}

/// Distribution identity. Exactly one of `name` or `image` must be set.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistributionType {
    /// Catalog name (e.g. "starter", "remote-vllm")
    #[serde(default)]
    pub name: Option<String>,
    /// Direct container image reference
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default = "default_container_name")]
    pub name: String,
    /// Port the server listens on
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub resources: Option<ResourceRequirementsSpec>,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodOverrides {
    /// Use an existing service account instead of the operator-managed one
    #[serde(default)]
    pub service_account_name: Option<String>,
    /// Extra pod volumes, passed through as-is
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields_list")]
    pub volumes: Vec<serde_json::Value>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountSpec>,
    #[serde(default)]
    pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub sub_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default = "default_storage_size")]
    pub size: String,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            mount_path: default_mount_path(),
        }
    }
}

/// User-supplied server configuration (`run.yaml`).
///
/// Either reference an existing ConfigMap or provide the content inline.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserConfigSpec {
    #[serde(default)]
    pub config_map_name: Option<String>,
    /// Defaults to the distribution's own namespace
    #[serde(default)]
    pub config_map_namespace: Option<String>,
    #[serde(default)]
    pub inline: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_bundle: Option<CaBundleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaBundleConfig {
    pub config_map_name: String,
    #[serde(default)]
    pub config_map_namespace: Option<String>,
    /// Keys holding PEM certificates
    #[serde(default = "default_ca_bundle_keys")]
    pub config_map_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    #[serde(default)]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    #[serde(default, rename = "targetCPUUtilizationPercentage")]
    pub target_cpu_utilization_percentage: Option<i32>,
    #[serde(default)]
    pub target_memory_utilization_percentage: Option<i32>,
}

/// Either bound may be an integer or a percentage string
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::int_or_string")]
    pub min_available: Option<serde_json::Value>,
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::int_or_string")]
    pub max_unavailable: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraintSpec {
    #[serde(default = "default_max_skew")]
    pub max_skew: i32,
    pub topology_key: String,
    #[serde(default = "default_when_unsatisfiable")]
    pub when_unsatisfiable: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Create an Ingress for the server
    #[serde(default)]
    pub expose_route: bool,
    #[serde(default)]
    pub ingress_host: Option<String>,
    #[serde(default)]
    pub ingress_class_name: Option<String>,
    #[serde(default)]
    pub allowed_from: Option<AllowedFromSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedFromSpec {
    /// Extra namespaces allowed through the NetworkPolicy
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl LlamaStackDistributionSpec {
    /// Port the server listens on, falling back to the default
    #[must_use]
    pub fn server_port(&self) -> i32 {
        self.server
            .container_spec
            .as_ref()
            .and_then(|c| c.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    #[must_use]
    pub fn container_name(&self) -> &str {
        self.server
            .container_spec
            .as_ref()
            .map_or(DEFAULT_CONTAINER_NAME, |c| c.name.as_str())
    }

    #[must_use]
    pub fn autoscaling_enabled(&self) -> bool {
        self.server.autoscaling.is_some()
    }

    /// User-provided service account, if any
    #[must_use]
    pub fn service_account_override(&self) -> Option<&str> {
        self.server
            .pod_overrides
            .as_ref()
            .and_then(|p| p.service_account_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn expose_route(&self) -> bool {
        self.network.as_ref().is_some_and(|n| n.expose_route)
    }
}

pub fn default_replicas() -> i32 {
    1
}

fn default_container_name() -> String {
    DEFAULT_CONTAINER_NAME.to_string()
}

fn default_storage_size() -> String {
    DEFAULT_STORAGE_SIZE.to_string()
}

fn default_mount_path() -> String {
    DEFAULT_MOUNT_PATH.to_string()
}

fn default_ca_bundle_keys() -> Vec<String> {
    vec![DEFAULT_CA_BUNDLE_KEY.to_string()]
}

fn default_max_skew() -> i32 {
    1
}

fn default_when_unsatisfiable() -> String {
    "ScheduleAnyway".to_string()
}
