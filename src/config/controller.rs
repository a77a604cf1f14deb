//! # Controller Configuration
//!
//! Process-level settings loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS, DEFAULT_HEALTH_PROBE_TIMEOUT_SECS,
    DEFAULT_INITIALIZING_REQUEUE_SECS, DEFAULT_MANIFESTS_DIR,
    DEFAULT_MAX_CONCURRENT_RECONCILIATIONS, DEFAULT_METRICS_PORT, DEFAULT_OPERATOR_CONFIG_MAP,
    DEFAULT_OPERATOR_NAMESPACE, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_SERVER_POLL_INTERVAL_MS,
    DEFAULT_SERVER_STARTUP_TIMEOUT_SECS, DEFAULT_WATCH_RESTART_DELAY_SECS,
};

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Namespace the operator runs in (`POD_NAMESPACE`)
    pub operator_namespace: String,
    /// Name of the operator ConfigMap holding feature flags and image overrides
    pub operator_config_map: String,
    /// Template directory rendered for every distribution
    pub manifests_dir: PathBuf,
    /// Port for /metrics, /healthz and /readyz
    pub metrics_port: u16,
    pub server_startup_timeout_secs: u64,
    pub server_poll_interval_ms: u64,
    /// Timeout of each workload health probe request
    pub health_probe_timeout_secs: u64,
    /// Requeue delay while a distribution is Initializing
    pub initializing_requeue_secs: u64,
    /// Periodic resync for settled distributions
    pub resync_interval_secs: u64,
    /// Error backoff bounds (seconds)
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    /// Limits how many distributions reconcile simultaneously
    pub max_concurrent_reconciliations: u16,
    /// Delay before restarting the controller stream after it ends
    pub watch_restart_delay_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            operator_config_map: DEFAULT_OPERATOR_CONFIG_MAP.to_string(),
            manifests_dir: PathBuf::from(DEFAULT_MANIFESTS_DIR),
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            health_probe_timeout_secs: DEFAULT_HEALTH_PROBE_TIMEOUT_SECS,
            initializing_requeue_secs: DEFAULT_INITIALIZING_REQUEUE_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            operator_namespace: lookup("POD_NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.operator_namespace),
            operator_config_map: lookup("OPERATOR_CONFIG_MAP")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.operator_config_map),
            manifests_dir: lookup("MANIFESTS_DIR")
                .filter(|v| !v.is_empty())
                .map_or(defaults.manifests_dir, PathBuf::from),
            metrics_port: parse_or(lookup("METRICS_PORT"), defaults.metrics_port),
            server_startup_timeout_secs: parse_or(
                lookup("SERVER_STARTUP_TIMEOUT_SECS"),
                defaults.server_startup_timeout_secs,
            ),
            server_poll_interval_ms: parse_or(
                lookup("SERVER_POLL_INTERVAL_MS"),
                defaults.server_poll_interval_ms,
            ),
            health_probe_timeout_secs: parse_or(
                lookup("HEALTH_PROBE_TIMEOUT_SECS"),
                defaults.health_probe_timeout_secs,
            ),
            initializing_requeue_secs: parse_or(
                lookup("INITIALIZING_REQUEUE_SECS"),
                defaults.initializing_requeue_secs,
            ),
            resync_interval_secs: parse_or(
                lookup("RESYNC_INTERVAL_SECS"),
                defaults.resync_interval_secs,
            ),
            backoff_min_secs: parse_or(lookup("BACKOFF_MIN_SECS"), defaults.backoff_min_secs),
            backoff_max_secs: parse_or(lookup("BACKOFF_MAX_SECS"), defaults.backoff_max_secs),
            max_concurrent_reconciliations: parse_or(
                lookup("MAX_CONCURRENT_RECONCILIATIONS"),
                defaults.max_concurrent_reconciliations,
            ),
            watch_restart_delay_secs: parse_or(
                lookup("WATCH_RESTART_DELAY_SECS"),
                defaults.watch_restart_delay_secs,
            ),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT").unwrap_or(defaults.log_format),
        }
    }

    #[must_use]
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }

    #[must_use]
    pub fn initializing_requeue(&self) -> Duration {
        Duration::from_secs(self.initializing_requeue_secs)
    }

    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    #[must_use]
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Parse an optional raw value, keeping the default when absent or invalid
fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_environment() {
        let config = ControllerConfig::from_lookup(|_| None);
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.initializing_requeue(), Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("POD_NAMESPACE", "ops"),
            ("MANIFESTS_DIR", "/opt/manifests"),
            ("METRICS_PORT", "not-a-port"),
            ("BACKOFF_MAX_SECS", " 120 "),
        ]);
        let config = ControllerConfig::from_lookup(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.operator_namespace, "ops");
        assert_eq!(config.manifests_dir, PathBuf::from("/opt/manifests"));
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(config.backoff_max_secs, 120);
    }
}
