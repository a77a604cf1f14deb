//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use llama_stack_operator::prelude::*;
//! ```

// CRD types - most commonly used
pub use crate::crd::*;

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    reconcile, BackoffState, HealthProbe, Reconciler, ReconcilerError, TriggerSource,
};

// Cluster access
pub use crate::apply::{ApplyEngine, ClusterClient, InMemoryCluster, KubeClusterClient};

// Config types - for configuration management
pub use crate::config::{ControllerConfig, OperatorConfig, SharedOperatorConfig};

// Rendering
pub use crate::manifest::{render_manifests, ManifestContext, RenderError, ResourceMap};
