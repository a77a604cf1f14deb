use serde_json::Value;
use std::collections::BTreeMap;

/// Runtime inputs the renderer merges into the Deployment.
///
/// Rebuilt on every reconcile and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestContext {
    /// Resolved container image
    pub image: String,
    /// Pod-template annotation key to content hash
    pub content_hashes: BTreeMap<String, String>,
    /// Pod spec fragment merged over the template's pod spec
    pub pod_spec: Value,
}
