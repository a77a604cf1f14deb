//! # Controller
//!
//! Core controller modules for the LlamaStack operator.
//!
//! - `backoff`: Fibonacci backoff for failed reconciles
//! - `catalog`: Distribution name to image resolution
//! - `reconciler`: Core reconciliation logic
//! - `watch`: Event filtering and ConfigMap reference tracking

pub mod backoff;
pub mod catalog;
pub mod reconciler;
pub mod watch;
