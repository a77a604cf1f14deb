//! # Apply Engine
//!
//! Reconciles each rendered object against live state on its own:
//!
//! 1. the distribution itself is never applied
//! 2. scope comes from the cluster's REST mapping; failure aborts
//! 3. absent objects are created with ownership markers
//! 4. present objects are only touched when owned
//! 5. PersistentVolumeClaims are never patched
//! 6. Services are checked for ports added outside the operator
//! 7. everything else is server-side applied with forced ownership
//!
//! Role bindings whose role does not exist are skipped entirely.

use kube::{Resource as _, ResourceExt};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::cluster::{ClusterClient, KindInfo};
use super::ownership::{checker_for, OwnershipChecker};
use super::ApplyError;
use crate::constants::MANAGED_PORTS_ANNOTATION;
use crate::crd::LlamaStackDistribution;
use crate::manifest::{Resource, ResourceKey, ResourceMap};
use crate::observability::metrics;

/// Decision taken for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Patched,
    Unchanged,
    Deleted,
    SkippedSelf,
    SkippedNotOwned,
    SkippedImmutable,
    SkippedMissingRole,
}

impl ApplyAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Created => "created",
            ApplyAction::Patched => "patched",
            ApplyAction::Unchanged => "unchanged",
            ApplyAction::Deleted => "deleted",
            ApplyAction::SkippedSelf => "skipped-self",
            ApplyAction::SkippedNotOwned => "skipped-not-owned",
            ApplyAction::SkippedImmutable => "skipped-immutable",
            ApplyAction::SkippedMissingRole => "skipped-missing-role",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub outcomes: Vec<(ResourceKey, ApplyAction)>,
}

impl ApplyReport {
    #[must_use]
    pub fn count(&self, action: ApplyAction) -> usize {
        self.outcomes.iter().filter(|(_, a)| *a == action).count()
    }
}

pub struct ApplyEngine<'a> {
    cluster: &'a dyn ClusterClient,
    owner: &'a LlamaStackDistribution,
    field_manager: String,
}

impl std::fmt::Debug for ApplyEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("owner", &self.owner.name_any())
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl<'a> ApplyEngine<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterClient, owner: &'a LlamaStackDistribution) -> Self {
        Self {
            cluster,
            owner,
            field_manager: owner.name_any(),
        }
    }

    /// Apply every object, stopping at the first error
    pub async fn apply_all(&self, resources: &ResourceMap) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        for resource in resources.iter() {
            let action = self.apply_one(resource).await?;
            metrics::increment_apply_operations(action.as_str(), resource.kind());
            report.outcomes.push((resource.key(), action));
        }
        Ok(report)
    }

    /// Delete excluded objects that this distribution owns
    pub async fn delete_excluded(&self, resources: &ResourceMap) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        for resource in resources.iter() {
            let action = self.delete_one(resource).await?;
            if action != ApplyAction::Unchanged {
                metrics::increment_apply_operations(action.as_str(), resource.kind());
            }
            report.outcomes.push((resource.key(), action));
        }
        Ok(report)
    }

    pub async fn apply_one(&self, resource: &Resource) -> Result<ApplyAction, ApplyError> {
        if self.is_self(resource) {
            return Ok(ApplyAction::SkippedSelf);
        }

        let kind = self.resolve(resource).await?;
        let checker = checker_for(kind.scope);
        let mut desired = self.prepare(resource, &kind, checker)?;

        if desired.kind() == "ClusterRoleBinding" && !self.role_exists(&desired).await? {
            let role = desired
                .pointer("/roleRef/name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            info!(
                resource = %desired.key(),
                role,
                action = ApplyAction::SkippedMissingRole.as_str(),
                "Referenced role missing, skipping binding"
            );
            return Ok(ApplyAction::SkippedMissingRole);
        }

        let namespace = kind.effective_namespace(desired.namespace()).map(str::to_string);
        let live = self
            .cluster
            .get(&kind, namespace.as_deref(), desired.name())
            .await
            .map_err(|source| ApplyError::cluster("get", &desired, source))?;

        let Some(live) = live else {
            if desired.kind() == "Service" {
                annotate_managed_ports(&mut desired);
            }
            self.cluster
                .create(&kind, &desired, &self.field_manager)
                .await
                .map_err(|source| ApplyError::cluster("create", &desired, source))?;
            info!(
                resource = %desired.key(),
                action = ApplyAction::Created.as_str(),
                "Created object"
            );
            return Ok(ApplyAction::Created);
        };

        if !checker.is_owned(&live, &desired, self.owner) {
            debug!(
                resource = %desired.key(),
                owner = %self.owner.name_any(),
                action = ApplyAction::SkippedNotOwned.as_str(),
                "Object exists but is not owned by this distribution, skipping"
            );
            metrics::increment_ownership_skips(desired.kind());
            return Ok(ApplyAction::SkippedNotOwned);
        }

        match desired.kind() {
            "PersistentVolumeClaim" => {
                debug!(
                    resource = %desired.key(),
                    action = ApplyAction::SkippedImmutable.as_str(),
                    "PersistentVolumeClaim exists, never patched"
                );
                return Ok(ApplyAction::SkippedImmutable);
            }
            "Service" => {
                check_service_drift(&live, &desired)?;
                annotate_managed_ports(&mut desired);
            }
            "Deployment" => preserve_selector(&live, &mut desired),
            _ => {}
        }

        let applied = self
            .cluster
            .apply(&kind, &desired, &self.field_manager)
            .await
            .map_err(|source| ApplyError::cluster("apply", &desired, source))?;

        if applied.resource_version() == live.resource_version() {
            debug!(resource = %desired.key(), "Object unchanged");
            Ok(ApplyAction::Unchanged)
        } else {
            info!(
                resource = %desired.key(),
                action = ApplyAction::Patched.as_str(),
                "Patched object"
            );
            Ok(ApplyAction::Patched)
        }
    }

    async fn delete_one(&self, resource: &Resource) -> Result<ApplyAction, ApplyError> {
        if self.is_self(resource) {
            return Ok(ApplyAction::SkippedSelf);
        }
        let kind = self.resolve(resource).await?;
        let checker = checker_for(kind.scope);
        let desired = self.prepare(resource, &kind, checker)?;
        let namespace = kind.effective_namespace(desired.namespace()).map(str::to_string);

        let live = self
            .cluster
            .get(&kind, namespace.as_deref(), desired.name())
            .await
            .map_err(|source| ApplyError::cluster("get", &desired, source))?;
        let Some(live) = live else {
            return Ok(ApplyAction::Unchanged);
        };
        if !checker.is_owned(&live, &desired, self.owner) {
            debug!(
                resource = %desired.key(),
                action = ApplyAction::SkippedNotOwned.as_str(),
                "Excluded object not owned by this distribution, leaving it"
            );
            metrics::increment_ownership_skips(desired.kind());
            return Ok(ApplyAction::SkippedNotOwned);
        }

        self.cluster
            .delete(&kind, namespace.as_deref(), desired.name())
            .await
            .map_err(|source| ApplyError::cluster("delete", &desired, source))?;
        info!(
            resource = %desired.key(),
            action = ApplyAction::Deleted.as_str(),
            "Deleted object whose feature is disabled"
        );
        Ok(ApplyAction::Deleted)
    }

    fn is_self(&self, resource: &Resource) -> bool {
        resource.kind() == LlamaStackDistribution::kind(&())
            && resource.api_version() == LlamaStackDistribution::api_version(&())
            && resource.name() == self.owner.name_any()
            && resource
                .namespace()
                .is_none_or(|ns| Some(ns.to_string()) == self.owner.namespace())
    }

    async fn resolve(&self, resource: &Resource) -> Result<KindInfo, ApplyError> {
        self.cluster
            .resolve_kind(resource.api_version(), resource.kind())
            .await
            .map_err(|source| ApplyError::ScopeResolution {
                api_version: resource.api_version().to_string(),
                kind: resource.kind().to_string(),
                source,
            })
    }

    /// Desired object with scope-correct namespace and ownership markers
    fn prepare(
        &self,
        resource: &Resource,
        kind: &KindInfo,
        checker: &dyn OwnershipChecker,
    ) -> Result<Resource, ApplyError> {
        let mut desired = resource.clone();
        if kind.is_cluster_scoped() {
            desired.clear_namespace();
        } else if desired.namespace().is_none() {
            if let Some(ns) = self.owner.namespace() {
                desired.set_namespace(&ns);
            }
        }
        checker.claim(&mut desired, self.owner)?;
        Ok(desired)
    }

    async fn role_exists(&self, binding: &Resource) -> Result<bool, ApplyError> {
        let role_kind = binding
            .pointer("/roleRef/kind")
            .and_then(Value::as_str)
            .unwrap_or("ClusterRole");
        let Some(role_name) = binding.pointer("/roleRef/name").and_then(Value::as_str) else {
            return Ok(false);
        };
        let api_version = binding
            .pointer("/roleRef/apiGroup")
            .and_then(Value::as_str)
            .map_or_else(|| "rbac.authorization.k8s.io/v1".to_string(), |g| format!("{g}/v1"));

        let kind = self
            .cluster
            .resolve_kind(&api_version, role_kind)
            .await
            .map_err(|source| ApplyError::ScopeResolution {
                api_version: api_version.clone(),
                kind: role_kind.to_string(),
                source,
            })?;
        let namespace = kind.effective_namespace(binding.namespace());
        let role = self
            .cluster
            .get(&kind, namespace, role_name)
            .await
            .map_err(|source| ApplyError::cluster("get role for", binding, source))?;
        Ok(role.is_some())
    }
}

/// `port/PROTOCOL` for every declared Service port
fn service_ports(resource: &Resource) -> BTreeSet<String> {
    resource
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = p.get("port").and_then(Value::as_i64)?;
                    let protocol = p.get("protocol").and_then(Value::as_str).unwrap_or("TCP");
                    Some(format!("{port}/{protocol}"))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn managed_ports(live: &Resource) -> BTreeSet<String> {
    live.annotations()
        .get(MANAGED_PORTS_ANNOTATION)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Fail when the live Service has ports the operator never declared
pub(crate) fn check_service_drift(live: &Resource, desired: &Resource) -> Result<(), ApplyError> {
    let desired_ports = service_ports(desired);
    let previously_managed = managed_ports(live);
    let unexpected: Vec<String> = service_ports(live)
        .into_iter()
        .filter(|p| !desired_ports.contains(p) && !previously_managed.contains(p))
        .collect();
    if unexpected.is_empty() {
        Ok(())
    } else {
        Err(ApplyError::ServiceDrift {
            key: desired.key().to_string(),
            ports: unexpected.join(", "),
        })
    }
}

fn annotate_managed_ports(desired: &mut Resource) {
    let ports = service_ports(desired).into_iter().collect::<Vec<_>>().join(",");
    desired.set_annotation(MANAGED_PORTS_ANNOTATION, &ports);
}

/// The selector is immutable once the Deployment exists
fn preserve_selector(live: &Resource, desired: &mut Resource) {
    let Some(selector) = live.pointer("/spec/selector").cloned() else {
        return;
    };
    if let Some(spec) = desired
        .as_value_mut()
        .get_mut("spec")
        .and_then(Value::as_object_mut)
    {
        spec.insert("selector".to_string(), selector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::memory::{InMemoryCluster, Verb};
    use crate::test_support::distribution;
    use serde_json::json;

    fn service(ports: &[i64]) -> Resource {
        let ports: Vec<Value> = ports
            .iter()
            .map(|p| json!({"name": format!("p{p}"), "port": p, "protocol": "TCP"}))
            .collect();
        Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "demo-service", "namespace": "team-a"},
            "spec": {"ports": ports}
        }))
        .unwrap()
    }

    fn pvc(size: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "demo-pvc", "namespace": "team-a"},
            "spec": {"resources": {"requests": {"storage": size}}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_unchanged() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);

        assert_eq!(engine.apply_one(&service(&[8321])).await.unwrap(), ApplyAction::Created);
        assert_eq!(engine.apply_one(&service(&[8321])).await.unwrap(), ApplyAction::Unchanged);
        assert_eq!(cluster.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_self_reference_is_skipped() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);
        let me = Resource::from_value(json!({
            "apiVersion": "llamastack.io/v1alpha1",
            "kind": "LlamaStackDistribution",
            "metadata": {"name": "demo", "namespace": "team-a"}
        }))
        .unwrap();

        assert_eq!(engine.apply_one(&me).await.unwrap(), ApplyAction::SkippedSelf);
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_pvc_never_patched() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);

        engine.apply_one(&pvc("10Gi")).await.unwrap();
        assert_eq!(
            engine.apply_one(&pvc("50Gi")).await.unwrap(),
            ApplyAction::SkippedImmutable
        );
        let live = cluster
            .object("PersistentVolumeClaim", Some("team-a"), "demo-pvc")
            .unwrap();
        assert_eq!(live["spec"]["resources"]["requests"]["storage"], "10Gi");
    }

    #[tokio::test]
    async fn test_unowned_object_is_left_alone() {
        let cluster = InMemoryCluster::new();
        cluster
            .seed(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "demo-service", "namespace": "team-a"},
                "spec": {"ports": [{"port": 80}]}
            }))
            .unwrap();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);

        assert_eq!(
            engine.apply_one(&service(&[8321])).await.unwrap(),
            ApplyAction::SkippedNotOwned
        );
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_service_port_fails_loudly() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);
        engine.apply_one(&service(&[8321])).await.unwrap();

        cluster.update_object("Service", Some("team-a"), "demo-service", |svc| {
            svc["spec"]["ports"]
                .as_array_mut()
                .unwrap()
                .push(json!({"port": 9999, "protocol": "TCP"}));
        });

        let err = engine.apply_one(&service(&[8321])).await.unwrap_err();
        assert!(matches!(err, ApplyError::ServiceDrift { ref ports, .. } if ports == "9999/TCP"));
    }

    #[tokio::test]
    async fn test_changed_service_port_is_not_drift() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);
        engine.apply_one(&service(&[8321])).await.unwrap();

        assert_eq!(engine.apply_one(&service(&[9000])).await.unwrap(), ApplyAction::Patched);
    }

    #[tokio::test]
    async fn test_deployment_selector_is_preserved() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);
        let deployment = |selector: Value| {
            Resource::from_value(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "demo", "namespace": "team-a"},
                "spec": {"selector": {"matchLabels": selector}, "replicas": 1}
            }))
            .unwrap()
        };

        engine.apply_one(&deployment(json!({"app": "old"}))).await.unwrap();
        engine.apply_one(&deployment(json!({"app": "new"}))).await.unwrap();
        let live = cluster.object("Deployment", Some("team-a"), "demo").unwrap();
        assert_eq!(live["spec"]["selector"]["matchLabels"], json!({"app": "old"}));
    }

    #[tokio::test]
    async fn test_binding_skipped_without_role() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);
        let binding = Resource::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": "team-a-demo-scc-binding"},
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "anyuid"},
            "subjects": [{"kind": "ServiceAccount", "name": "demo-sa", "namespace": "team-a"}]
        }))
        .unwrap();

        assert_eq!(
            engine.apply_one(&binding).await.unwrap(),
            ApplyAction::SkippedMissingRole
        );

        cluster
            .seed(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRole",
                "metadata": {"name": "anyuid"}
            }))
            .unwrap();
        assert_eq!(engine.apply_one(&binding).await.unwrap(), ApplyAction::Created);
        let stored = cluster
            .object("ClusterRoleBinding", None, "team-a-demo-scc-binding")
            .unwrap();
        assert!(stored.pointer("/metadata/ownerReferences").is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_scope_is_fatal() {
        let cluster = InMemoryCluster::new();
        cluster.unregister_kind("v1", "Service");
        let owner = distribution("demo", "team-a");
        let engine = ApplyEngine::new(&cluster, &owner);

        assert!(matches!(
            engine.apply_one(&service(&[8321])).await,
            Err(ApplyError::ScopeResolution { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_excluded_only_owned() {
        let cluster = InMemoryCluster::new();
        let owner = distribution("demo", "team-a");
        let other = distribution("demo", "team-b");
        ApplyEngine::new(&cluster, &owner)
            .apply_one(&pvc("10Gi"))
            .await
            .unwrap();

        let excluded: ResourceMap = vec![pvc("10Gi")].into_iter().collect();
        let report = ApplyEngine::new(&cluster, &other)
            .delete_excluded(&excluded)
            .await
            .unwrap();
        // other distribution resolves the same namespace/name only when
        // namespaces match; here the object is in team-a
        assert_eq!(report.count(ApplyAction::Deleted), 0);

        let report = ApplyEngine::new(&cluster, &owner)
            .delete_excluded(&excluded)
            .await
            .unwrap();
        assert_eq!(report.count(ApplyAction::Deleted), 1);
        assert!(cluster
            .mutations()
            .iter()
            .any(|m| m.verb == Verb::Delete && m.kind == "PersistentVolumeClaim"));
    }
}
