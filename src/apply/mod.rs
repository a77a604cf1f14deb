//! # Apply
//!
//! Pushes rendered objects into the cluster.
//!
//! ## Module Structure
//!
//! - `cluster.rs` - Cluster client seam and the kube-backed implementation
//! - `memory.rs` - In-memory cluster used by tests and dry runs
//! - `ownership.rs` - Ownership markers for namespaced and cluster-scoped objects
//! - `engine.rs` - Per-object create / patch / skip / delete decisions

pub mod cluster;
mod engine;
pub mod memory;
pub mod ownership;

pub use cluster::{ClusterClient, ClusterError, KindInfo, KubeClusterClient, ResourceScope};
pub use engine::{ApplyAction, ApplyEngine, ApplyReport};
pub use memory::InMemoryCluster;

use thiserror::Error;

use crate::manifest::Resource;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to resolve scope of {api_version}/{kind}: {source}")]
    ScopeResolution {
        api_version: String,
        kind: String,
        #[source]
        source: ClusterError,
    },
    #[error("failed to {action} {key}: {source}")]
    Cluster {
        action: &'static str,
        key: String,
        #[source]
        source: ClusterError,
    },
    #[error(
        "Service {key} has ports not declared by the operator ({ports}); refusing to overwrite manual changes"
    )]
    ServiceDrift { key: String, ports: String },
    #[error("distribution {name} has no UID yet")]
    MissingOwnerIdentity { name: String },
    #[error("invalid object {key}: {reason}")]
    InvalidObject { key: String, reason: String },
}

impl ApplyError {
    pub(crate) fn cluster(action: &'static str, resource: &Resource, source: ClusterError) -> Self {
        ApplyError::Cluster {
            action,
            key: resource.key().to_string(),
            source,
        }
    }
}
