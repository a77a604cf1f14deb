//! # Operator ConfigMap Watch
//!
//! Watches the operator ConfigMap and swaps in a freshly parsed
//! [`OperatorConfig`] whenever it changes. Every successful reload is
//! announced on a channel the controller turns into a reconcile of all
//! distributions.

use futures::channel::mpsc;
use futures::{pin_mut, SinkExt, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube_runtime::watcher;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{OperatorConfig, SharedOperatorConfig};

/// Start watching the operator ConfigMap
///
/// Sends `()` on `reload_tx` after every applied change. Parse failures keep
/// the previous configuration.
pub fn start_operator_config_watch(
    client: kube::Client,
    namespace: &str,
    configmap_name: &str,
    operator_config: SharedOperatorConfig,
    reload_tx: mpsc::Sender<()>,
) {
    let namespace = namespace.to_string();
    let configmap_name = configmap_name.to_string();
    tokio::spawn(async move {
        let configmaps: Api<ConfigMap> = Api::namespaced(client, &namespace);
        let watcher_config =
            watcher::Config::default().fields(&format!("metadata.name={configmap_name}"));

        info!(
            "Starting watch for operator ConfigMap '{}' in namespace '{}'",
            configmap_name, namespace
        );

        let stream = watcher(configmaps, watcher_config);
        pin_mut!(stream);
        let mut reload_tx = reload_tx;

        while let Some(event_result) = stream.next().await {
            let update = match event_result {
                Ok(watcher::Event::Apply(configmap)) => Some(configmap),
                Ok(watcher::Event::Delete(_)) => {
                    warn!(
                        "Operator ConfigMap '{}' was deleted, reverting to defaults",
                        configmap_name
                    );
                    Some(ConfigMap::default())
                }
                // Initial listing was already loaded at startup
                Ok(
                    watcher::Event::Init
                    | watcher::Event::InitApply(_)
                    | watcher::Event::InitDone,
                ) => None,
                Err(e) => {
                    error!("Error watching operator ConfigMap: {}", e);
                    None
                }
            };

            let Some(configmap) = update else {
                continue;
            };
            if reload_operator_config(&configmap, &operator_config).await
                && reload_tx.send(()).await.is_err()
            {
                warn!("Reload receiver dropped, stopping operator ConfigMap watch");
                break;
            }
        }

        warn!("Operator ConfigMap watch stream ended");
    });
}

/// Parse and swap in a new configuration. Returns whether it changed.
pub async fn reload_operator_config(
    configmap: &ConfigMap,
    operator_config: &SharedOperatorConfig,
) -> bool {
    let parsed = match OperatorConfig::from_config_map(configmap) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Ignoring invalid operator configuration: {}", e);
            return false;
        }
    };

    let mut current = operator_config.write().await;
    if **current == parsed {
        return false;
    }
    info!(
        network_policy = parsed.feature_flags.network_policy_enabled(),
        image_overrides = parsed.image_overrides.len(),
        "Operator configuration reloaded"
    );
    *current = Arc::new(parsed);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_shared_operator_config;
    use crate::constants::{FEATURE_FLAGS_KEY, IMAGE_OVERRIDES_KEY};
    use std::collections::BTreeMap;

    fn configmap(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reload_swaps_configuration() {
        let shared = create_shared_operator_config(OperatorConfig::default());
        let cm = configmap(&[(IMAGE_OVERRIDES_KEY, "starter: quay.io/x/starter:1\n")]);

        assert!(reload_operator_config(&cm, &shared).await);
        let snapshot = Arc::clone(&*shared.read().await);
        assert_eq!(snapshot.image_overrides.len(), 1);

        // unchanged content is not a reload
        assert!(!reload_operator_config(&cm, &shared).await);
    }

    #[tokio::test]
    async fn test_invalid_configuration_keeps_previous() {
        let shared = create_shared_operator_config(OperatorConfig::default());
        let cm = configmap(&[(FEATURE_FLAGS_KEY, "enableNetworkPolicy: [")]);

        assert!(!reload_operator_config(&cm, &shared).await);
        assert_eq!(**shared.read().await, OperatorConfig::default());
    }

    #[tokio::test]
    async fn test_deleted_configmap_reverts_to_defaults() {
        let shared = create_shared_operator_config(OperatorConfig {
            feature_flags: crate::config::FeatureFlags::with_network_policy(true),
            image_overrides: BTreeMap::new(),
        });

        assert!(reload_operator_config(&ConfigMap::default(), &shared).await);
        assert!(!shared.read().await.feature_flags.network_policy_enabled());
    }
}
