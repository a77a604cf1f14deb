//! Names and labels of objects rendered for a distribution.

use std::collections::BTreeMap;

use crate::constants::{
    APP_LABEL, APP_LABEL_VALUE, CA_BUNDLE_SUFFIX, CLUSTER_ROLE_BINDING_SUFFIX, INSTANCE_LABEL,
    PVC_SUFFIX, SERVICE_ACCOUNT_SUFFIX, SERVICE_SUFFIX, USER_CONFIG_SUFFIX,
};
use crate::crd::LlamaStackDistribution;
use kube::ResourceExt;

/// The Deployment keeps the bare distribution name
#[must_use]
pub fn deployment_name(dist: &LlamaStackDistribution) -> String {
    dist.name_any()
}

#[must_use]
pub fn service_name(dist: &LlamaStackDistribution) -> String {
    format!("{}-{SERVICE_SUFFIX}", dist.name_any())
}

#[must_use]
pub fn pvc_name(dist: &LlamaStackDistribution) -> String {
    format!("{}-{PVC_SUFFIX}", dist.name_any())
}

/// Service account the pods run as: the override, else the managed one
#[must_use]
pub fn service_account_name(dist: &LlamaStackDistribution) -> String {
    dist.spec
        .service_account_override()
        .map_or_else(|| managed_service_account_name(dist), str::to_string)
}

#[must_use]
pub fn managed_service_account_name(dist: &LlamaStackDistribution) -> String {
    format!("{}-{SERVICE_ACCOUNT_SUFFIX}", dist.name_any())
}

/// `{namespace}-{name}-scc-binding`, unique across namespaces
#[must_use]
pub fn cluster_role_binding_name(dist: &LlamaStackDistribution) -> String {
    format!(
        "{}{CLUSTER_ROLE_BINDING_SUFFIX}",
        cluster_name_prefix(dist)
    )
}

/// Prefix every cluster-scoped object of this distribution carries
#[must_use]
pub fn cluster_name_prefix(dist: &LlamaStackDistribution) -> String {
    format!(
        "{}-{}-",
        dist.namespace().unwrap_or_default(),
        dist.name_any()
    )
}

#[must_use]
pub fn user_config_map_name(dist: &LlamaStackDistribution) -> String {
    format!("{}-{USER_CONFIG_SUFFIX}", dist.name_any())
}

#[must_use]
pub fn ca_bundle_map_name(dist: &LlamaStackDistribution) -> String {
    format!("{}-{CA_BUNDLE_SUFFIX}", dist.name_any())
}

/// Labels selecting this distribution's pods
#[must_use]
pub fn selector_labels(dist: &LlamaStackDistribution) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), dist.name_any()),
    ])
}

/// In-cluster URL of the server
#[must_use]
pub fn service_url(dist: &LlamaStackDistribution) -> String {
    format!(
        "http://{}.{}.svc.cluster.local:{}",
        service_name(dist),
        dist.namespace().unwrap_or_default(),
        dist.spec.server_port()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::distribution;

    #[test]
    fn test_names() {
        let dist = distribution("demo", "team-a");
        assert_eq!(deployment_name(&dist), "demo");
        assert_eq!(service_name(&dist), "demo-service");
        assert_eq!(pvc_name(&dist), "demo-pvc");
        assert_eq!(service_account_name(&dist), "demo-sa");
        assert_eq!(cluster_role_binding_name(&dist), "team-a-demo-scc-binding");
        assert_eq!(
            service_url(&dist),
            "http://demo-service.team-a.svc.cluster.local:8321"
        );
    }

    #[test]
    fn test_service_account_override() {
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.pod_overrides = Some(crate::crd::PodOverrides {
            service_account_name: Some("custom".to_string()),
            ..Default::default()
        });
        assert_eq!(service_account_name(&dist), "custom");
        assert_eq!(managed_service_account_name(&dist), "demo-sa");
    }
}
