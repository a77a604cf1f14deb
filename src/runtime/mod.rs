//! # Runtime
//!
//! Process lifecycle of the operator.
//!
//! - `initialization`: logging, metrics server, operator config and the reconciler context
//! - `watch_loop`: the controller over distribution, ConfigMap and reload triggers
//! - `error_policy`: backoff for failed reconciles and stream errors

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
