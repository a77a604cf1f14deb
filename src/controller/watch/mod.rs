//! # Change Detection
//!
//! Decides which events lead to a reconcile.
//!
//! - `predicates.rs` - Drops distribution events whose spec did not change
//! - `references.rs` - Resolves changed ConfigMaps to the distributions that read them

pub mod predicates;
pub mod references;

pub use predicates::{spec_diff, SpecChange, SpecChangePredicate};
pub use references::{
    referenced_config_maps, Affected, DistributionLister, LookupResult, ReferenceIndex,
    ReferenceResolver,
};
