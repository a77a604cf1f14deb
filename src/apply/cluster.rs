//! # Cluster Client
//!
//! The seam between the apply engine and the Kubernetes API. Objects travel
//! as untyped [`Resource`] documents; kinds are resolved through discovery
//! so the engine learns each kind's scope from the cluster itself.

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::Api;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::manifest::Resource;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no REST mapping for {api_version}/{kind}: {reason}")]
    Discovery {
        api_version: String,
        kind: String,
        reason: String,
    },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Api(#[from] kube::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

/// A resolved kind: API coordinates plus scope
#[derive(Debug, Clone)]
pub struct KindInfo {
    pub api_resource: ApiResource,
    pub scope: ResourceScope,
}

impl KindInfo {
    #[must_use]
    pub fn new(api_version: &str, kind: &str, plural: &str, scope: ResourceScope) -> Self {
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self {
            api_resource: ApiResource::from_gvk_with_plural(&gvk, plural),
            scope,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        self.scope == ResourceScope::Cluster
    }

    /// Namespace to address an object of this kind with
    #[must_use]
    pub fn effective_namespace<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        match self.scope {
            ResourceScope::Namespaced => namespace,
            ResourceScope::Cluster => None,
        }
    }
}

/// `apps/v1` → (`apps`, `v1`); `v1` → (``, `v1`)
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Resolve a kind through the cluster's REST mapping
    async fn resolve_kind(&self, api_version: &str, kind: &str) -> Result<KindInfo, ClusterError>;

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError>;

    async fn create(
        &self,
        kind: &KindInfo,
        resource: &Resource,
        field_manager: &str,
    ) -> Result<Resource, ClusterError>;

    /// Server-side apply with forced ownership
    async fn apply(
        &self,
        kind: &KindInfo,
        resource: &Resource,
        field_manager: &str,
    ) -> Result<Resource, ClusterError>;

    /// Delete, treating an already missing object as success
    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ClusterError>;
}

/// Resolve and fetch a typed object
pub async fn get_typed<K: DeserializeOwned>(
    cluster: &dyn ClusterClient,
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>, ClusterError> {
    let info = cluster.resolve_kind(api_version, kind).await?;
    let Some(resource) = cluster.get(&info, namespace, name).await? else {
        return Ok(None);
    };
    serde_json::from_value(resource.into_value())
        .map(Some)
        .map_err(|e| ClusterError::Invalid(format!("{kind} {name}: {e}")))
}

/// [`ClusterClient`] backed by a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
    kinds: Arc<RwLock<HashMap<(String, String), KindInfo>>>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            kinds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn api(&self, kind: &KindInfo, namespace: Option<&str>) -> Api<DynamicObject> {
        match kind.effective_namespace(namespace) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &kind.api_resource),
            None => Api::all_with(self.client.clone(), &kind.api_resource),
        }
    }
}

fn to_dynamic(resource: &Resource) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(resource.as_value().clone())
        .map_err(|e| ClusterError::Invalid(format!("{}: {e}", resource.key())))
}

fn from_dynamic(object: &DynamicObject) -> Result<Resource, ClusterError> {
    let value = serde_json::to_value(object).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    Resource::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn resolve_kind(&self, api_version: &str, kind: &str) -> Result<KindInfo, ClusterError> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(info) = self.kinds.read().await.get(&key) {
            return Ok(info.clone());
        }

        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (api_resource, capabilities) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClusterError::Discovery {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                reason: e.to_string(),
            })?;
        let scope = match capabilities.scope {
            Scope::Cluster => ResourceScope::Cluster,
            Scope::Namespaced => ResourceScope::Namespaced,
        };
        debug!(api_version, kind, ?scope, "Resolved kind");

        let info = KindInfo {
            api_resource,
            scope,
        };
        self.kinds.write().await.insert(key, info.clone());
        Ok(info)
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError> {
        match self.api(kind, namespace).get_opt(name).await? {
            Some(object) => Ok(Some(from_dynamic(&object)?)),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        kind: &KindInfo,
        resource: &Resource,
        field_manager: &str,
    ) -> Result<Resource, ClusterError> {
        let params = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        let created = self
            .api(kind, resource.namespace())
            .create(&params, &to_dynamic(resource)?)
            .await?;
        from_dynamic(&created)
    }

    async fn apply(
        &self,
        kind: &KindInfo,
        resource: &Resource,
        field_manager: &str,
    ) -> Result<Resource, ClusterError> {
        let params = PatchParams::apply(field_manager).force();
        let applied = self
            .api(kind, resource.namespace())
            .patch(resource.name(), &params, &Patch::Apply(resource.as_value()))
            .await?;
        from_dynamic(&applied)
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ClusterError> {
        self.api(kind, namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}
