//! # Custom Resource Definitions
//!
//! CRD types for the Llama Stack operator.
//!
//! ## Module Structure
//!
//! - `spec.rs` - Main CRD specification and default values
//! - `status.rs` - Status types written by the status state machine

mod spec;
mod status;

pub use spec::{
    AllowedFromSpec, AutoscalingSpec, CaBundleConfig, ContainerSpec, DistributionType,
    EnvVarSpec, LlamaStackDistribution, LlamaStackDistributionSpec, NetworkSpec,
    PodDisruptionBudgetSpec, PodOverrides, ResourceRequirementsSpec, ServerSpec, StorageSpec,
    TlsConfig, TopologySpreadConstraintSpec, UserConfigSpec, VolumeMountSpec, default_replicas,
};
pub use status::{
    Condition, DistributionConfigStatus, DistributionPhase, LlamaStackDistributionStatus,
    ProviderHealthStatus, ProviderInfo, VersionInfo,
};

/// Schema for free-form objects (structural schemas need the preserve flag)
pub fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

pub fn preserve_unknown_fields_list(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    })
}

pub fn int_or_string(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "x-kubernetes-int-or-string": true
    })
}
