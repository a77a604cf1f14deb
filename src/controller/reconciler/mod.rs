//! # Reconciler
//!
//! Drives a `LlamaStackDistribution` towards its declared state.
//!
//! ## Module Structure
//!
//! - `types.rs` - Reconciler context, errors, backoff state
//! - `validation.rs` - Input checks that run before any mutation
//! - `configmaps.rs` - Referenced ConfigMaps, mirrors and content hashes
//! - `context.rs` - Manifest context (image, pod spec, hashes)
//! - `health.rs` - Probes of the running server
//! - `status.rs` - Phase and condition state machine
//! - `reconcile.rs` - The orchestrated reconcile pass

pub mod configmaps;
pub mod context;
pub mod health;
pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

pub use health::{HealthProbe, HealthProbeError, HttpHealthProbe, ProbeReport};
pub use reconcile::reconcile;
pub use types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};
pub use validation::ValidationError;
