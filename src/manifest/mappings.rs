//! # Field Mappings (rule set v1)
//!
//! The versioned list of [`FieldMapping`]s the renderer applies to the
//! shipped templates. Every rule carries a default so a distribution with
//! no optional fields still renders valid manifests.

use kube::ResourceExt;
use serde_json::{json, Value};

use super::names;
use super::path::FieldPath;
use super::transform::FieldMapping;
use crate::constants::{
    DEFAULT_HPA_CPU_TARGET, DEFAULT_SERVER_PORT, DEFAULT_STORAGE_SIZE, INSTANCE_LABEL,
};
use crate::crd::{default_replicas, LlamaStackDistribution};

/// Version tag of the rule set below
pub const MAPPINGS_VERSION: &str = "v1";

/// Kinds that get the instance label on their own metadata
const LABELLED_KINDS: [&str; 8] = [
    "Deployment",
    "Service",
    "PersistentVolumeClaim",
    "NetworkPolicy",
    "ServiceAccount",
    "Ingress",
    "HorizontalPodAutoscaler",
    "PodDisruptionBudget",
];

/// Rule set v1
#[must_use]
pub fn field_mappings_v1(
    dist: &LlamaStackDistribution,
    operator_namespace: &str,
) -> Vec<FieldMapping> {
    let name = dist.name_any();
    let namespace = dist.namespace().unwrap_or_default();
    let spec = &dist.spec;
    let port = spec.server_port();
    let instance = FieldPath::escape(INSTANCE_LABEL);

    let mut mappings: Vec<FieldMapping> = LABELLED_KINDS
        .iter()
        .map(|kind| {
            FieldMapping::new(*kind, format!("/metadata/labels/{instance}"))
                .value(name.as_str())
                .create_if_missing()
        })
        .collect();

    // Deployment
    mappings.extend([
        FieldMapping::new("Deployment", "/metadata/name").value(names::deployment_name(dist)),
        FieldMapping::new("Deployment", "/spec/replicas")
            .value(spec.replicas)
            .default(default_replicas()),
        FieldMapping::new("Deployment", format!("/spec/selector/matchLabels/{instance}"))
            .value(name.as_str())
            .create_if_missing(),
        FieldMapping::new(
            "Deployment",
            format!("/spec/template/metadata/labels/{instance}"),
        )
        .value(name.as_str())
        .create_if_missing(),
        FieldMapping::new("Deployment", "/spec/template/spec/serviceAccountName")
            .value(names::service_account_name(dist))
            .create_if_missing(),
        FieldMapping::new("Deployment", "/spec/template/spec/containers/0/name")
            .value(spec.container_name()),
        FieldMapping::new(
            "Deployment",
            "/spec/template/spec/containers/0/ports/0/containerPort",
        )
        .value(port)
        .default(DEFAULT_SERVER_PORT),
        FieldMapping::new(
            "Deployment",
            "/spec/template/spec/containers/0/readinessProbe/httpGet/port",
        )
        .value(port)
        .default(DEFAULT_SERVER_PORT),
    ]);

    // Service
    mappings.extend([
        FieldMapping::new("Service", "/spec/ports/0/port")
            .value(port)
            .default(DEFAULT_SERVER_PORT),
        FieldMapping::new("Service", "/spec/ports/0/targetPort")
            .value(port)
            .default(DEFAULT_SERVER_PORT)
            .create_if_missing(),
        FieldMapping::new("Service", format!("/spec/selector/{instance}"))
            .value(name.as_str())
            .create_if_missing(),
    ]);

    // PersistentVolumeClaim
    mappings.push(
        FieldMapping::new("PersistentVolumeClaim", "/spec/resources/requests/storage")
            .value_opt(spec.server.storage.as_ref().map(|s| s.size.clone()))
            .default(DEFAULT_STORAGE_SIZE)
            .create_if_missing(),
    );

    // NetworkPolicy
    mappings.extend([
        FieldMapping::new(
            "NetworkPolicy",
            format!("/spec/podSelector/matchLabels/{instance}"),
        )
        .value(name.as_str())
        .create_if_missing(),
        FieldMapping::new("NetworkPolicy", "/spec/ingress/0/ports/0/port")
            .value(port)
            .default(DEFAULT_SERVER_PORT),
        FieldMapping::new(
            "NetworkPolicy",
            format!(
                "/spec/ingress/0/from/1/namespaceSelector/matchLabels/{}",
                FieldPath::escape("kubernetes.io/metadata.name")
            ),
        )
        .value(operator_namespace),
        FieldMapping::new("NetworkPolicy", "/spec/ingress/1")
            .value_opt(allowed_namespaces_rule(dist, port))
            .create_if_missing(),
    ]);

    // ServiceAccount and ClusterRoleBinding
    mappings.extend([
        FieldMapping::new("ServiceAccount", "/metadata/name")
            .value(names::managed_service_account_name(dist)),
        FieldMapping::new("ClusterRoleBinding", "/metadata/name")
            .value(names::cluster_role_binding_name(dist)),
        FieldMapping::new("ClusterRoleBinding", "/subjects/0/name")
            .value(names::managed_service_account_name(dist)),
        FieldMapping::new("ClusterRoleBinding", "/subjects/0/namespace").value(namespace),
    ]);

    // Ingress
    let network = spec.network.as_ref();
    mappings.extend([
        FieldMapping::new(
            "Ingress",
            "/spec/rules/0/http/paths/0/backend/service/name",
        )
        .value(names::service_name(dist)),
        FieldMapping::new(
            "Ingress",
            "/spec/rules/0/http/paths/0/backend/service/port/number",
        )
        .value(port)
        .default(DEFAULT_SERVER_PORT),
        FieldMapping::new("Ingress", "/spec/rules/0/host")
            .value_opt(network.and_then(|n| n.ingress_host.clone()))
            .create_if_missing(),
        FieldMapping::new("Ingress", "/spec/ingressClassName")
            .value_opt(network.and_then(|n| n.ingress_class_name.clone()))
            .create_if_missing(),
    ]);

    // HorizontalPodAutoscaler
    let autoscaling = spec.server.autoscaling.as_ref();
    mappings.extend([
        FieldMapping::new("HorizontalPodAutoscaler", "/spec/scaleTargetRef/name")
            .value(names::deployment_name(dist)),
        FieldMapping::new("HorizontalPodAutoscaler", "/spec/minReplicas")
            .value_opt(autoscaling.and_then(|a| a.min_replicas))
            .default(spec.replicas.max(1)),
        FieldMapping::new("HorizontalPodAutoscaler", "/spec/maxReplicas")
            .value_opt(autoscaling.map(|a| a.max_replicas)),
        FieldMapping::new(
            "HorizontalPodAutoscaler",
            "/spec/metrics/0/resource/target/averageUtilization",
        )
        .value_opt(autoscaling.and_then(|a| a.target_cpu_utilization_percentage))
        .default(DEFAULT_HPA_CPU_TARGET),
        FieldMapping::new("HorizontalPodAutoscaler", "/spec/metrics/1")
            .value_opt(
                autoscaling
                    .and_then(|a| a.target_memory_utilization_percentage)
                    .map(memory_metric),
            )
            .create_if_missing(),
    ]);

    // PodDisruptionBudget: minAvailable defaults to 1 only when no bound is given
    let pdb = spec.server.pod_disruption_budget.as_ref();
    let max_unavailable = pdb.and_then(|p| p.max_unavailable.clone());
    let mut min_available = FieldMapping::new("PodDisruptionBudget", "/spec/minAvailable")
        .value_opt(pdb.and_then(|p| p.min_available.clone()))
        .create_if_missing();
    if max_unavailable.is_none() {
        min_available = min_available.default(1);
    }
    mappings.extend([
        min_available,
        FieldMapping::new("PodDisruptionBudget", "/spec/maxUnavailable")
            .value_opt(max_unavailable)
            .create_if_missing(),
        FieldMapping::new(
            "PodDisruptionBudget",
            format!("/spec/selector/matchLabels/{instance}"),
        )
        .value(name.as_str())
        .create_if_missing(),
    ]);

    mappings
}

fn allowed_namespaces_rule(dist: &LlamaStackDistribution, port: i32) -> Option<Value> {
    let namespaces = &dist.spec.network.as_ref()?.allowed_from.as_ref()?.namespaces;
    if namespaces.is_empty() {
        return None;
    }
    Some(json!({
        "from": [{
            "namespaceSelector": {
                "matchExpressions": [{
                    "key": "kubernetes.io/metadata.name",
                    "operator": "In",
                    "values": namespaces,
                }]
            }
        }],
        "ports": [{"protocol": "TCP", "port": port}]
    }))
}

fn memory_metric(target: i32) -> Value {
    json!({
        "type": "Resource",
        "resource": {
            "name": "memory",
            "target": {"type": "Utilization", "averageUtilization": target}
        }
    })
}
