//! # Operator Configuration
//!
//! Feature flags and catalog image overrides read from the operator
//! ConfigMap. The parsed value is immutable; a reload swaps in a new
//! `Arc<OperatorConfig>` and every reconcile works from the snapshot it
//! took when it started.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, PostParams};
use kube::Api;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::constants::{FEATURE_FLAGS_KEY, IMAGE_OVERRIDES_KEY, OPERATOR_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {FEATURE_FLAGS_KEY} document: {0}")]
    FeatureFlags(#[source] serde_yaml::Error),
    #[error("invalid {IMAGE_OVERRIDES_KEY} document: {0}")]
    ImageOverrides(#[source] serde_yaml::Error),
    #[error("image override for '{name}' is not a valid image reference: '{image}'")]
    InvalidImage { name: String, image: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeatureFlag {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Render a NetworkPolicy per distribution
    #[serde(default)]
    pub enable_network_policy: FeatureFlag,
}

impl FeatureFlags {
    #[must_use]
    pub fn network_policy_enabled(&self) -> bool {
        self.enable_network_policy.enabled
    }

    #[must_use]
    pub fn with_network_policy(enabled: bool) -> Self {
        Self {
            enable_network_policy: FeatureFlag { enabled },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorConfig {
    pub feature_flags: FeatureFlags,
    /// Catalog name to image, consulted before the built-in catalog
    pub image_overrides: BTreeMap<String, String>,
}

/// Shared operator configuration, replaced wholesale on reload
pub type SharedOperatorConfig = Arc<RwLock<Arc<OperatorConfig>>>;

#[must_use]
pub fn create_shared_operator_config(config: OperatorConfig) -> SharedOperatorConfig {
    Arc::new(RwLock::new(Arc::new(config)))
}

impl OperatorConfig {
    /// Parse the ConfigMap data. Missing keys fall back to defaults.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let feature_flags = match data.get(FEATURE_FLAGS_KEY).filter(|v| !v.trim().is_empty()) {
            Some(raw) => serde_yaml::from_str(raw).map_err(ConfigError::FeatureFlags)?,
            None => FeatureFlags::default(),
        };
        let image_overrides: BTreeMap<String, String> =
            match data.get(IMAGE_OVERRIDES_KEY).filter(|v| !v.trim().is_empty()) {
                Some(raw) => serde_yaml::from_str(raw).map_err(ConfigError::ImageOverrides)?,
                None => BTreeMap::new(),
            };
        for (name, image) in &image_overrides {
            if !is_image_reference(image) {
                return Err(ConfigError::InvalidImage {
                    name: name.clone(),
                    image: image.clone(),
                });
            }
        }
        Ok(Self {
            feature_flags,
            image_overrides,
        })
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self, ConfigError> {
        Self::from_data(&config_map.data.clone().unwrap_or_default())
    }

    /// ConfigMap data written when the operator creates the ConfigMap itself
    pub fn to_data(&self) -> Result<BTreeMap<String, String>, serde_yaml::Error> {
        let mut data = BTreeMap::new();
        data.insert(
            FEATURE_FLAGS_KEY.to_string(),
            serde_yaml::to_string(&self.feature_flags)?,
        );
        if !self.image_overrides.is_empty() {
            data.insert(
                IMAGE_OVERRIDES_KEY.to_string(),
                serde_yaml::to_string(&self.image_overrides)?,
            );
        }
        Ok(data)
    }
}

fn is_image_reference(image: &str) -> bool {
    !image.is_empty() && !image.chars().any(char::is_whitespace) && !image.starts_with(['/', ':'])
}

/// Read the operator ConfigMap, creating it with defaults when absent
pub async fn load_or_create_operator_config(
    client: kube::Client,
    namespace: &str,
    name: &str,
) -> Result<OperatorConfig> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);

    if let Some(config_map) = api
        .get_opt(name)
        .await
        .with_context(|| format!("Failed to read operator ConfigMap {namespace}/{name}"))?
    {
        let config = OperatorConfig::from_config_map(&config_map)
            .with_context(|| format!("Invalid operator ConfigMap {namespace}/{name}"))?;
        info!(
            network_policy = config.feature_flags.network_policy_enabled(),
            image_overrides = config.image_overrides.len(),
            "Loaded operator configuration"
        );
        return Ok(config);
    }

    let config = OperatorConfig::default();
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                crate::constants::MANAGED_BY_LABEL.to_string(),
                OPERATOR_NAME.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(config.to_data().context("Failed to serialize default feature flags")?),
        ..Default::default()
    };

    match api.create(&PostParams::default(), &config_map).await {
        Ok(_) => info!("Created operator ConfigMap {namespace}/{name} with defaults"),
        // Another replica won the race
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => warn!("Failed to create operator ConfigMap {namespace}/{name}: {e}, using defaults"),
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data_gives_defaults() {
        let config = OperatorConfig::from_data(&BTreeMap::new()).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert!(!config.feature_flags.network_policy_enabled());
    }

    #[test]
    fn test_parse_feature_flags_and_overrides() {
        let data = BTreeMap::from([
            (
                FEATURE_FLAGS_KEY.to_string(),
                "enableNetworkPolicy:\n  enabled: true\n".to_string(),
            ),
            (
                IMAGE_OVERRIDES_KEY.to_string(),
                "starter: quay.io/custom/starter:v2\n".to_string(),
            ),
        ]);
        let config = OperatorConfig::from_data(&data).unwrap();
        assert!(config.feature_flags.network_policy_enabled());
        assert_eq!(
            config.image_overrides.get("starter").map(String::as_str),
            Some("quay.io/custom/starter:v2")
        );
    }

    #[test]
    fn test_invalid_override_rejected() {
        let data = BTreeMap::from([(
            IMAGE_OVERRIDES_KEY.to_string(),
            "starter: \"bad image\"\n".to_string(),
        )]);
        assert!(matches!(
            OperatorConfig::from_data(&data),
            Err(ConfigError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_malformed_flags_rejected() {
        let data = BTreeMap::from([(
            FEATURE_FLAGS_KEY.to_string(),
            "enableNetworkPolicy: [".to_string(),
        )]);
        assert!(matches!(
            OperatorConfig::from_data(&data),
            Err(ConfigError::FeatureFlags(_))
        ));
    }

    #[test]
    fn test_default_data_roundtrips() {
        let config = OperatorConfig {
            feature_flags: FeatureFlags::with_network_policy(true),
            image_overrides: BTreeMap::from([("starter".to_string(), "img:1".to_string())]),
        };
        let parsed = OperatorConfig::from_data(&config.to_data().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
