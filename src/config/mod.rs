//! # Configuration
//!
//! - `controller.rs` - Process settings from environment variables
//! - `operator.rs` - Feature flags and image overrides from the operator ConfigMap
//! - `watch.rs` - Hot reload of the operator ConfigMap

mod controller;
mod operator;
mod watch;

pub use controller::ControllerConfig;
pub use operator::{
    create_shared_operator_config, load_or_create_operator_config, ConfigError, FeatureFlag,
    FeatureFlags, OperatorConfig, SharedOperatorConfig,
};
pub use watch::{reload_operator_config, start_operator_config_watch};
