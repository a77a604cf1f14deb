//! # Referenced ConfigMaps
//!
//! Validates the ConfigMaps a distribution points at and works out what the
//! pods mount:
//!
//! - same-namespace references are mounted as they are and never written
//! - references into another namespace are mirrored into an owned ConfigMap
//! - inline user configuration becomes an owned ConfigMap
//!
//! Each source yields a content hash that ends up as a pod-template
//! annotation, so edits to referenced configuration roll the pods.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

use super::validation::{validate_pem_bundle, ValidationError};
use crate::apply::cluster::{get_typed, ClusterClient};
use crate::constants::{CA_BUNDLE_HASH_ANNOTATION, USER_CONFIG_HASH_ANNOTATION, USER_CONFIG_KEY};
use crate::crd::LlamaStackDistribution;
use crate::manifest::{names, Resource, ResourceMap};

/// A ConfigMap in the distribution's namespace that the pods mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedConfigMap {
    pub name: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMapPlan {
    /// Owned ConfigMaps to apply
    pub owned: ResourceMap,
    /// Owned ConfigMaps no longer needed
    pub stale: ResourceMap,
    pub user_config: Option<MountedConfigMap>,
    pub ca_bundle: Option<MountedConfigMap>,
    /// Pod-template annotation to content hash
    pub content_hashes: BTreeMap<String, String>,
}

/// Hex sha256 over the given parts
#[must_use]
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub async fn reconcile_config_maps(
    cluster: &dyn ClusterClient,
    dist: &LlamaStackDistribution,
) -> Result<ConfigMapPlan> {
    let namespace = dist.namespace().unwrap_or_default();
    let mut plan = ConfigMapPlan::default();

    reconcile_user_config(cluster, dist, &namespace, &mut plan).await?;
    reconcile_ca_bundle(cluster, dist, &namespace, &mut plan).await?;

    debug!(
        resource = %dist.name_any(),
        owned = plan.owned.len(),
        stale = plan.stale.len(),
        hashes = plan.content_hashes.len(),
        "Reconciled referenced ConfigMaps"
    );
    Ok(plan)
}

async fn reconcile_user_config(
    cluster: &dyn ClusterClient,
    dist: &LlamaStackDistribution,
    namespace: &str,
    plan: &mut ConfigMapPlan,
) -> Result<()> {
    let mirror_name = names::user_config_map_name(dist);
    let Some(user_config) = dist.spec.server.user_config.as_ref() else {
        plan.stale.insert(owned_config_map(dist, &mirror_name, BTreeMap::new())?);
        return Ok(());
    };
    let referenced = user_config.config_map_name.as_deref().filter(|s| !s.is_empty());
    let inline = user_config.inline.as_deref().filter(|s| !s.is_empty());

    match (referenced, inline) {
        (Some(_), Some(_)) => Err(ValidationError::ConflictingUserConfig.into()),
        (None, Some(content)) => {
            serde_yaml::from_str::<serde_yaml::Value>(content).map_err(|e| {
                ValidationError::InvalidInlineConfig {
                    reason: e.to_string(),
                }
            })?;
            let data = BTreeMap::from([(USER_CONFIG_KEY.to_string(), content.to_string())]);
            plan.owned.insert(owned_config_map(dist, &mirror_name, data)?);
            plan.content_hashes.insert(
                USER_CONFIG_HASH_ANNOTATION.to_string(),
                content_hash(&["inline", mirror_name.as_str(), content]),
            );
            plan.user_config = Some(MountedConfigMap {
                name: mirror_name,
                keys: vec![USER_CONFIG_KEY.to_string()],
            });
            Ok(())
        }
        (Some(name), None) => {
            let source_namespace = user_config.config_map_namespace.as_deref().unwrap_or(namespace);
            let source = fetch(cluster, source_namespace, name).await?;
            let data = source.data.clone().unwrap_or_default();
            let content = data.get(USER_CONFIG_KEY).ok_or_else(|| {
                ValidationError::MissingConfigMapKey {
                    namespace: source_namespace.to_string(),
                    name: name.to_string(),
                    key: USER_CONFIG_KEY.to_string(),
                }
            })?;

            let resource_version = source.resource_version().unwrap_or_default();
            plan.content_hashes.insert(
                USER_CONFIG_HASH_ANNOTATION.to_string(),
                content_hash(&[resource_version.as_str(), name]),
            );

            let mounted = if source_namespace == namespace {
                plan.stale.insert(owned_config_map(dist, &mirror_name, BTreeMap::new())?);
                name.to_string()
            } else {
                let mirrored = BTreeMap::from([(USER_CONFIG_KEY.to_string(), content.clone())]);
                plan.owned.insert(owned_config_map(dist, &mirror_name, mirrored)?);
                mirror_name
            };
            plan.user_config = Some(MountedConfigMap {
                name: mounted,
                keys: vec![USER_CONFIG_KEY.to_string()],
            });
            Ok(())
        }
        (None, None) => {
            plan.stale.insert(owned_config_map(dist, &mirror_name, BTreeMap::new())?);
            Ok(())
        }
    }
}

async fn reconcile_ca_bundle(
    cluster: &dyn ClusterClient,
    dist: &LlamaStackDistribution,
    namespace: &str,
    plan: &mut ConfigMapPlan,
) -> Result<()> {
    let mirror_name = names::ca_bundle_map_name(dist);
    let Some(ca_bundle) = dist
        .spec
        .server
        .tls_config
        .as_ref()
        .and_then(|tls| tls.ca_bundle.as_ref())
    else {
        plan.stale.insert(owned_config_map(dist, &mirror_name, BTreeMap::new())?);
        return Ok(());
    };

    let name = ca_bundle.config_map_name.as_str();
    let source_namespace = ca_bundle.config_map_namespace.as_deref().unwrap_or(namespace);
    let source = fetch(cluster, source_namespace, name).await?;
    let data = source.data.clone().unwrap_or_default();

    let resource_version = source.resource_version().unwrap_or_default();
    let mut hash_parts: Vec<&str> = vec![resource_version.as_str(), name];
    let mut consumed = BTreeMap::new();
    for key in &ca_bundle.config_map_keys {
        let content = data.get(key).ok_or_else(|| ValidationError::MissingConfigMapKey {
            namespace: source_namespace.to_string(),
            name: name.to_string(),
            key: key.clone(),
        })?;
        validate_pem_bundle(content).map_err(|reason| ValidationError::InvalidCertificate {
            namespace: source_namespace.to_string(),
            name: name.to_string(),
            key: key.clone(),
            reason,
        })?;
        hash_parts.push(key.as_str());
        hash_parts.push(content.as_str());
        consumed.insert(key.clone(), content.clone());
    }
    plan.content_hashes.insert(
        CA_BUNDLE_HASH_ANNOTATION.to_string(),
        content_hash(&hash_parts),
    );

    let mounted = if source_namespace == namespace {
        plan.stale.insert(owned_config_map(dist, &mirror_name, BTreeMap::new())?);
        name.to_string()
    } else {
        plan.owned.insert(owned_config_map(dist, &mirror_name, consumed)?);
        mirror_name
    };
    plan.ca_bundle = Some(MountedConfigMap {
        name: mounted,
        keys: ca_bundle.config_map_keys.clone(),
    });
    Ok(())
}

async fn fetch(cluster: &dyn ClusterClient, namespace: &str, name: &str) -> Result<ConfigMap> {
    get_typed::<ConfigMap>(cluster, "v1", "ConfigMap", Some(namespace), name)
        .await
        .with_context(|| format!("failed to read ConfigMap {namespace}/{name}"))?
        .ok_or_else(|| {
            ValidationError::ConfigMapNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
            .into()
        })
}

fn owned_config_map(
    dist: &LlamaStackDistribution,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<Resource> {
    let resource = Resource::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": dist.namespace().unwrap_or_default(),
            "labels": names::selector_labels(dist),
        },
        "data": data,
    }))?;
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::memory::InMemoryCluster;
    use crate::crd::{CaBundleConfig, TlsConfig, UserConfigSpec};
    use crate::test_support::{distribution, TEST_CERTIFICATE};

    fn seed_config_map(cluster: &InMemoryCluster, namespace: &str, name: &str, data: serde_json::Value) {
        cluster
            .seed(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": namespace},
                "data": data
            }))
            .unwrap();
    }

    fn validation(err: &anyhow::Error) -> Option<&ValidationError> {
        err.downcast_ref::<ValidationError>()
    }

    #[tokio::test]
    async fn test_no_references_marks_mirrors_stale() {
        let cluster = InMemoryCluster::new();
        let dist = distribution("demo", "team-a");
        let plan = reconcile_config_maps(&cluster, &dist).await.unwrap();

        assert!(plan.owned.is_empty());
        assert_eq!(plan.stale.len(), 2);
        assert!(plan.content_hashes.is_empty());
    }

    #[tokio::test]
    async fn test_same_namespace_reference_is_mounted_directly() {
        let cluster = InMemoryCluster::new();
        seed_config_map(&cluster, "team-a", "cfg", json!({"run.yaml": "version: 2"}));
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            config_map_name: Some("cfg".to_string()),
            ..Default::default()
        });

        let plan = reconcile_config_maps(&cluster, &dist).await.unwrap();
        assert_eq!(plan.user_config.unwrap().name, "cfg");
        assert!(plan.owned.is_empty());
        assert!(plan.content_hashes.contains_key(USER_CONFIG_HASH_ANNOTATION));
    }

    #[tokio::test]
    async fn test_cross_namespace_reference_is_mirrored() {
        let cluster = InMemoryCluster::new();
        seed_config_map(&cluster, "shared", "cfg", json!({"run.yaml": "version: 2"}));
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            config_map_name: Some("cfg".to_string()),
            config_map_namespace: Some("shared".to_string()),
            inline: None,
        });

        let plan = reconcile_config_maps(&cluster, &dist).await.unwrap();
        assert_eq!(plan.user_config.unwrap().name, "demo-user-config");
        let mirror = plan.owned.find_kind("ConfigMap").unwrap();
        assert_eq!(mirror.namespace(), Some("team-a"));
        assert_eq!(mirror.pointer("/data/run.yaml").unwrap(), "version: 2");
    }

    #[tokio::test]
    async fn test_hash_changes_with_content() {
        let cluster = InMemoryCluster::new();
        seed_config_map(&cluster, "team-a", "cfg", json!({"run.yaml": "version: 2"}));
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            config_map_name: Some("cfg".to_string()),
            ..Default::default()
        });

        let before = reconcile_config_maps(&cluster, &dist).await.unwrap().content_hashes;
        cluster.update_object("ConfigMap", Some("team-a"), "cfg", |cm| {
            cm["data"]["run.yaml"] = json!("version: 3");
        });
        let after = reconcile_config_maps(&cluster, &dist).await.unwrap().content_hashes;

        assert_ne!(
            before[USER_CONFIG_HASH_ANNOTATION],
            after[USER_CONFIG_HASH_ANNOTATION]
        );
    }

    #[tokio::test]
    async fn test_missing_config_map_is_validation_error() {
        let cluster = InMemoryCluster::new();
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            config_map_name: Some("absent".to_string()),
            ..Default::default()
        });

        let err = reconcile_config_maps(&cluster, &dist).await.unwrap_err();
        assert!(matches!(
            validation(&err),
            Some(ValidationError::ConfigMapNotFound { name, .. }) if name == "absent"
        ));
    }

    #[tokio::test]
    async fn test_conflicting_user_config() {
        let cluster = InMemoryCluster::new();
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            config_map_name: Some("cfg".to_string()),
            config_map_namespace: None,
            inline: Some("a: b".to_string()),
        });

        let err = reconcile_config_maps(&cluster, &dist).await.unwrap_err();
        assert_eq!(validation(&err), Some(&ValidationError::ConflictingUserConfig));
    }

    #[tokio::test]
    async fn test_inline_config_becomes_owned_config_map() {
        let cluster = InMemoryCluster::new();
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.user_config = Some(UserConfigSpec {
            inline: Some("version: 2\napis: []\n".to_string()),
            ..Default::default()
        });

        let plan = reconcile_config_maps(&cluster, &dist).await.unwrap();
        assert_eq!(plan.owned.len(), 1);
        assert_eq!(plan.user_config.unwrap().name, "demo-user-config");
    }

    #[tokio::test]
    async fn test_ca_bundle_validation() {
        let cluster = InMemoryCluster::new();
        seed_config_map(
            &cluster,
            "team-a",
            "ca",
            json!({"ca-bundle.crt": TEST_CERTIFICATE, "broken.crt": "not a cert"}),
        );
        let mut dist = distribution("demo", "team-a");
        let ca = |keys: Vec<&str>| {
            Some(TlsConfig {
                ca_bundle: Some(CaBundleConfig {
                    config_map_name: "ca".to_string(),
                    config_map_namespace: None,
                    config_map_keys: keys.into_iter().map(str::to_string).collect(),
                }),
            })
        };

        dist.spec.server.tls_config = ca(vec!["ca-bundle.crt"]);
        let plan = reconcile_config_maps(&cluster, &dist).await.unwrap();
        assert_eq!(plan.ca_bundle.unwrap().name, "ca");
        assert!(plan.content_hashes.contains_key(CA_BUNDLE_HASH_ANNOTATION));

        dist.spec.server.tls_config = ca(vec!["ca-bundle.crt", "broken.crt"]);
        let err = reconcile_config_maps(&cluster, &dist).await.unwrap_err();
        assert!(matches!(
            validation(&err),
            Some(ValidationError::InvalidCertificate { key, .. }) if key == "broken.crt"
        ));

        dist.spec.server.tls_config = ca(vec!["missing.crt"]);
        let err = reconcile_config_maps(&cluster, &dist).await.unwrap_err();
        assert!(matches!(
            validation(&err),
            Some(ValidationError::MissingConfigMapKey { key, .. }) if key == "missing.crt"
        ));
    }
}
