//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Field manager and managed-by label value
pub const OPERATOR_NAME: &str = "llama-stack-operator";

/// Default namespace the operator runs in
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "llama-stack-k8s-operator-system";

/// Operator-level ConfigMap holding feature flags and image overrides
pub const DEFAULT_OPERATOR_CONFIG_MAP: &str = "llama-stack-operator-config";

/// Key in the operator ConfigMap holding the feature flag document
pub const FEATURE_FLAGS_KEY: &str = "featureFlags";

/// Key in the operator ConfigMap holding catalog image overrides
pub const IMAGE_OVERRIDES_KEY: &str = "image-overrides";

/// Default template directory
pub const DEFAULT_MANIFESTS_DIR: &str = "manifests";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Requeue delay while replicas converge (phase Initializing)
pub const DEFAULT_INITIALIZING_REQUEUE_SECS: u64 = 10;

/// Periodic resync interval for settled resources
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Timeout for each workload health probe request
pub const DEFAULT_HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// Error backoff bounds (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

// Workload defaults. Changing any of these changes rendered manifests.

pub const DEFAULT_SERVER_PORT: i32 = 8321;
pub const DEFAULT_CONTAINER_NAME: &str = "llama-stack";
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";
pub const DEFAULT_MOUNT_PATH: &str = "/.llama";
pub const DEFAULT_CA_BUNDLE_KEY: &str = "ca-bundle.crt";
pub const DEFAULT_HPA_CPU_TARGET: i32 = 80;

/// Key the server reads its configuration from
pub const USER_CONFIG_KEY: &str = "run.yaml";
pub const USER_CONFIG_MOUNT_PATH: &str = "/etc/llama-stack";
pub const CA_BUNDLE_MOUNT_PATH: &str = "/etc/ssl/certs/ca-bundle";

pub const HEALTH_PATH: &str = "/v1/health";
pub const PROVIDERS_PATH: &str = "/v1/providers";
pub const VERSION_PATH: &str = "/v1/version";

// Labels and annotations

pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "llama-stack";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const OWNER_NAMESPACE_LABEL: &str = "llamastack.io/owner-namespace";

pub const USER_CONFIG_HASH_ANNOTATION: &str = "llamastack.io/user-config-hash";
pub const CA_BUNDLE_HASH_ANNOTATION: &str = "llamastack.io/ca-bundle-hash";

/// Service ports the operator declared on its last apply
pub const MANAGED_PORTS_ANNOTATION: &str = "llamastack.io/managed-ports";

// Name suffixes of rendered objects

pub const SERVICE_ACCOUNT_SUFFIX: &str = "sa";
pub const CLUSTER_ROLE_BINDING_SUFFIX: &str = "scc-binding";
pub const SERVICE_SUFFIX: &str = "service";
pub const PVC_SUFFIX: &str = "pvc";
pub const USER_CONFIG_SUFFIX: &str = "user-config";
pub const CA_BUNDLE_SUFFIX: &str = "ca-bundle";
