//! LlamaStack Operator Library
//!
//! Renders, applies and supervises `LlamaStackDistribution` workloads.
//! Tests are included in the module files and under `tests/`.
//!
//! ## Quick Start
//!
//! ```rust
//! use llama_stack_operator::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod apply;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod manifest;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;

#[doc(hidden)]
pub mod test_support;
