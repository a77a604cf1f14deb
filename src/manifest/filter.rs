//! # Resource Filter
//!
//! Splits a rendered [`ResourceMap`] into the objects to apply and the
//! objects whose feature is switched off. Excluded objects are handed to the
//! apply engine for deletion in case an earlier reconcile created them.

use serde_json::Value;

use super::resource::{Resource, ResourceMap};
use crate::config::FeatureFlags;
use crate::crd::LlamaStackDistribution;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub kept: ResourceMap,
    pub excluded: ResourceMap,
}

#[must_use]
pub fn filter_resources(
    resources: ResourceMap,
    dist: &LlamaStackDistribution,
    flags: &FeatureFlags,
) -> FilterOutcome {
    let (excluded, kept) =
        resources.partition(|resource| exclusion_reason(resource, dist, flags).is_some());
    FilterOutcome { kept, excluded }
}

/// Why a rendered object is left out, or `None` when it should be applied
#[must_use]
pub fn exclusion_reason(
    resource: &Resource,
    dist: &LlamaStackDistribution,
    flags: &FeatureFlags,
) -> Option<&'static str> {
    let spec = &dist.spec;
    match resource.kind() {
        "PersistentVolumeClaim" if spec.server.storage.is_none() => Some("no storage configured"),
        "NetworkPolicy" if !flags.network_policy_enabled() => Some("network policy disabled"),
        "Service" if !has_ports(resource) => Some("no ports declared"),
        "HorizontalPodAutoscaler" if !spec.autoscaling_enabled() => {
            Some("autoscaling not configured")
        }
        "PodDisruptionBudget" if spec.server.pod_disruption_budget.is_none() => {
            Some("disruption budget not configured")
        }
        "Ingress" if !spec.expose_route() => Some("route not exposed"),
        "ServiceAccount" | "ClusterRoleBinding" if spec.service_account_override().is_some() => {
            Some("service account overridden")
        }
        _ => None,
    }
}

fn has_ports(resource: &Resource) -> bool {
    resource
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .is_some_and(|ports| !ports.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NetworkSpec, PodOverrides, StorageSpec};
    use crate::manifest::render_manifests;
    use crate::test_support::{distribution, manifests_dir};

    fn kinds(map: &ResourceMap) -> Vec<String> {
        let mut kinds: Vec<_> = map.iter().map(|r| r.kind().to_string()).collect();
        kinds.sort();
        kinds
    }

    #[test]
    fn test_minimal_distribution_keeps_core_objects() {
        let dist = distribution("demo", "team-a");
        let map = render_manifests(&manifests_dir(), &dist, "operators", None).unwrap();
        let outcome = filter_resources(map, &dist, &FeatureFlags::default());

        assert_eq!(
            kinds(&outcome.kept),
            vec!["ClusterRoleBinding", "Deployment", "Service", "ServiceAccount"]
        );
        assert!(outcome
            .excluded
            .iter()
            .any(|r| r.kind() == "PersistentVolumeClaim"));
    }

    #[test]
    fn test_features_enable_objects() {
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.storage = Some(StorageSpec::default());
        dist.spec.network = Some(NetworkSpec {
            expose_route: true,
            ..Default::default()
        });
        let map = render_manifests(&manifests_dir(), &dist, "operators", None).unwrap();
        let flags = FeatureFlags::with_network_policy(true);
        let outcome = filter_resources(map, &dist, &flags);

        let kept = kinds(&outcome.kept);
        assert!(kept.contains(&"PersistentVolumeClaim".to_string()));
        assert!(kept.contains(&"NetworkPolicy".to_string()));
        assert!(kept.contains(&"Ingress".to_string()));
    }

    #[test]
    fn test_service_account_override_excludes_rbac_objects() {
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.pod_overrides = Some(PodOverrides {
            service_account_name: Some("existing".to_string()),
            ..Default::default()
        });
        let map = render_manifests(&manifests_dir(), &dist, "operators", None).unwrap();
        let outcome = filter_resources(map, &dist, &FeatureFlags::default());

        assert!(!outcome.kept.contains_kind("ServiceAccount"));
        assert!(!outcome.kept.contains_kind("ClusterRoleBinding"));
    }

    #[test]
    fn test_service_without_ports_is_excluded() {
        let dist = distribution("demo", "team-a");
        let service = Resource::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "demo-service"},
            "spec": {"ports": []}
        }))
        .unwrap();
        assert_eq!(
            exclusion_reason(&service, &dist, &FeatureFlags::default()),
            Some("no ports declared")
        );
    }
}
