//! # Reconcile Integration Tests
//!
//! Full reconciles against the in-memory cluster.
//!
//! These tests verify:
//! - A second reconcile without external change performs no mutation
//! - An interrupted reconcile converges once re-run
//! - Phase and condition transitions as the workload comes up
//! - Content hashes and image overrides reach the rendered Deployment

mod common;

use kube_runtime::controller::Action;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{deployment_image, distribution, pod_annotation, ClusterLister, Harness, SERVER_VERSION};
use llama_stack_operator::apply::memory::Verb;
use llama_stack_operator::config::OperatorConfig;
use llama_stack_operator::constants::USER_CONFIG_HASH_ANNOTATION;
use llama_stack_operator::controller::reconciler::{BackoffState, ReconcilerError};
use llama_stack_operator::controller::watch::{Affected, LookupResult, ReferenceResolver};
use llama_stack_operator::crd::{DistributionPhase, StorageSpec, UserConfigSpec};

const NS: &str = "team-a";
const STARTER_IMAGE: &str = "docker.io/llamastack/distribution-starter:latest";

fn condition_reason(h: &Harness, name: &str, condition: &str) -> (String, String, String) {
    let status = h.status(name, NS);
    let c = status
        .condition(condition)
        .unwrap_or_else(|| panic!("condition {condition} present"))
        .clone();
    (c.status, c.reason.unwrap_or_default(), c.message.unwrap_or_default())
}

#[tokio::test]
async fn test_first_reconcile_creates_workload() {
    let h = Harness::new();
    h.create(&distribution("demo", NS));

    let action = h.reconcile("demo", NS).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));

    assert!(h.object("Deployment", Some(NS), "demo").is_some());
    assert!(h.object("Service", Some(NS), "demo-service").is_some());
    assert!(h.object("ServiceAccount", Some(NS), "demo-sa").is_some());
    // no storage requested, no autoscaling, network policy flag off
    assert!(h.object("PersistentVolumeClaim", Some(NS), "demo-pvc").is_none());
    assert!(h.object("HorizontalPodAutoscaler", Some(NS), "demo-hpa").is_none());
    assert!(h.object("NetworkPolicy", Some(NS), "demo-network-policy").is_none());

    let deployment = h.deployment("demo", NS);
    assert_eq!(deployment_image(&deployment), STARTER_IMAGE);
    assert_eq!(deployment["metadata"]["ownerReferences"][0]["name"], "demo");

    let status = h.status("demo", NS);
    assert_eq!(status.phase, DistributionPhase::Initializing);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(
        status.service_url.as_deref(),
        Some("http://demo-service.team-a.svc.cluster.local:8321")
    );
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn test_second_reconcile_is_a_no_op() {
    let h = Harness::new();
    let mut dist = distribution("demo", NS);
    dist.spec.server.storage = Some(StorageSpec::default());
    h.create(&dist);

    h.reconcile("demo", NS).await.unwrap();
    assert!(h.cluster.mutation_count() > 0);
    h.cluster.clear_mutations();

    h.reconcile("demo", NS).await.unwrap();
    assert_eq!(h.cluster.mutations(), vec![]);
}

#[tokio::test]
async fn test_interrupted_reconcile_converges() {
    let reference = Harness::new();
    reference.create(&distribution("demo", NS));
    reference.reconcile("demo", NS).await.unwrap();

    let h = Harness::new();
    h.create(&distribution("demo", NS));
    h.cluster.fail_after(1);

    let err = h.reconcile("demo", NS).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::ReconciliationFailed(_)));
    assert_eq!(h.status("demo", NS).phase, DistributionPhase::Failed);
    let (status, reason, _) = condition_reason(&h, "demo", "DeploymentReady");
    assert_eq!((status.as_str(), reason.as_str()), ("False", "ReconcileFailed"));

    h.cluster.clear_failures();
    h.reconcile("demo", NS).await.unwrap();
    assert_eq!(h.status("demo", NS).phase, DistributionPhase::Initializing);

    for kind in ["Deployment", "Service", "ServiceAccount"] {
        let names = |harness: &Harness| {
            harness
                .cluster
                .objects_of_kind(kind)
                .iter()
                .map(|o| o["metadata"]["name"].as_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&h), names(&reference), "{kind} objects differ");
    }
    assert_eq!(
        h.deployment("demo", NS)["spec"],
        reference.deployment("demo", NS)["spec"]
    );
}

#[tokio::test]
async fn test_phase_follows_ready_replicas() {
    let h = Harness::new();
    h.create(&distribution("demo", NS));
    h.reconcile("demo", NS).await.unwrap();
    assert_eq!(
        condition_reason(&h, "demo", "HealthCheck"),
        (
            "Unknown".to_string(),
            "NotReady".to_string(),
            "Health is probed once the distribution is Ready (phase Initializing)".to_string()
        )
    );

    h.set_ready_replicas("demo", NS, 1);
    let action = h.reconcile("demo", NS).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));

    let status = h.status("demo", NS);
    assert_eq!(status.phase, DistributionPhase::Ready);
    assert_eq!(status.available_replicas, 1);
    assert_eq!(h.probe.calls(), 1);
    assert_eq!(status.condition("HealthCheck").unwrap().status, "True");
    assert_eq!(status.condition("DeploymentReady").unwrap().status, "True");
    assert_eq!(status.version.server_version.as_deref(), Some(SERVER_VERSION));
    assert_eq!(status.distribution_config.providers.len(), 1);
    assert_eq!(status.distribution_config.providers[0].provider_id, "ollama");
}

#[tokio::test]
async fn test_partial_readiness_requeues_soon() {
    let h = Harness::new();
    let mut dist = distribution("demo", NS);
    dist.spec.replicas = 3;
    h.create(&dist);
    h.reconcile("demo", NS).await.unwrap();

    h.set_ready_replicas("demo", NS, 2);
    let action = h.reconcile("demo", NS).await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    let status = h.status("demo", NS);
    assert_eq!(status.phase, DistributionPhase::Initializing);
    assert_eq!(status.available_replicas, 2);
    let (condition, reason, message) = condition_reason(&h, "demo", "DeploymentReady");
    assert_eq!(condition, "False");
    assert_eq!(reason, "ReplicasNotReady");
    assert_eq!(message, "2/3 replicas ready");
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn test_removed_storage_deletes_claim() {
    let h = Harness::new();
    let mut dist = distribution("demo", NS);
    dist.spec.server.storage = Some(StorageSpec::default());
    h.create(&dist);
    h.reconcile("demo", NS).await.unwrap();
    assert!(h.object("PersistentVolumeClaim", Some(NS), "demo-pvc").is_some());

    h.edit_spec("demo", NS, |spec| {
        spec["server"]["storage"] = serde_json::Value::Null;
    });
    h.cluster.clear_mutations();
    h.reconcile("demo", NS).await.unwrap();

    assert!(h.object("PersistentVolumeClaim", Some(NS), "demo-pvc").is_none());
    assert!(h
        .object_mutations()
        .contains(&(Verb::Delete, "PersistentVolumeClaim".to_string(), "demo-pvc".to_string())));
    let (status, reason, _) = condition_reason(&h, "demo", "StorageReady");
    assert_eq!((status.as_str(), reason.as_str()), ("True", "EphemeralStorage"));
}

#[tokio::test]
async fn test_referenced_config_map_change_rolls_only_its_owner() {
    let h = Harness::new();
    h.seed(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cfg", "namespace": NS},
        "data": {"run.yaml": "version: 2\n"}
    }));
    let mut alpha = distribution("alpha", NS);
    alpha.spec.server.user_config = Some(UserConfigSpec {
        config_map_name: Some("cfg".to_string()),
        ..UserConfigSpec::default()
    });
    h.create(&alpha);
    h.create(&distribution("beta", NS));
    h.reconcile("alpha", NS).await.unwrap();
    h.reconcile("beta", NS).await.unwrap();

    let before = pod_annotation(&h.deployment("alpha", NS), USER_CONFIG_HASH_ANNOTATION)
        .expect("hash annotation rendered")
        .to_string();

    // Only alpha is affected, whether the index or the scan answers
    let resolver = ReferenceResolver::new(
        h.reconciler.references.clone(),
        Arc::new(ClusterLister(Arc::clone(&h.cluster))),
    );
    let Affected::Some(owners) = resolver.affected_by(NS, "cfg").await else {
        panic!("scan should find the owner");
    };
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].name, "alpha");
    h.reconciler.references.set_synced(true);
    let LookupResult::Found(owners) = h.reconciler.references.lookup(NS, "cfg") else {
        panic!("synced index answers lookups");
    };
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].name, "alpha");

    h.cluster.update_object("ConfigMap", Some(NS), "cfg", |cm| {
        cm["data"]["run.yaml"] = json!("version: 2\nserver:\n  port: 8321\n");
    });
    h.cluster.clear_mutations();
    h.reconcile("alpha", NS).await.unwrap();

    let after = pod_annotation(&h.deployment("alpha", NS), USER_CONFIG_HASH_ANNOTATION)
        .expect("hash annotation rendered")
        .to_string();
    assert_ne!(before, after);
    assert_eq!(
        h.object_mutations(),
        vec![(Verb::Apply, "Deployment".to_string(), "alpha".to_string())]
    );
    assert!(pod_annotation(&h.deployment("beta", NS), USER_CONFIG_HASH_ANNOTATION).is_none());
}

#[tokio::test]
async fn test_image_override_applies_without_spec_change() {
    let h = Harness::new();
    h.create(&distribution("demo", NS));
    h.reconcile("demo", NS).await.unwrap();
    assert_eq!(deployment_image(&h.deployment("demo", NS)), STARTER_IMAGE);

    h.set_operator_config(OperatorConfig {
        image_overrides: BTreeMap::from([(
            "starter".to_string(),
            "quay.io/acme/llama-stack-starter:0.2.23".to_string(),
        )]),
        ..OperatorConfig::default()
    })
    .await;
    h.reconcile("demo", NS).await.unwrap();

    assert_eq!(
        deployment_image(&h.deployment("demo", NS)),
        "quay.io/acme/llama-stack-starter:0.2.23"
    );
    let status = h.status("demo", NS);
    assert_eq!(
        status.distribution_config.available_distributions["starter"],
        "quay.io/acme/llama-stack-starter:0.2.23"
    );
    assert_eq!(
        status.distribution_config.active_distribution.as_deref(),
        Some("starter")
    );
}

#[tokio::test]
async fn test_invalid_reference_fails_before_any_write() {
    let h = Harness::new();
    let mut dist = distribution("demo", NS);
    dist.spec.server.user_config = Some(UserConfigSpec {
        config_map_name: Some("missing".to_string()),
        ..UserConfigSpec::default()
    });
    h.create(&dist);

    let err = h.reconcile("demo", NS).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::Validation(_)));
    assert_eq!(h.object_mutations(), vec![]);

    let status = h.status("demo", NS);
    assert_eq!(status.phase, DistributionPhase::Failed);
    let (_, reason, message) = condition_reason(&h, "demo", "DeploymentReady");
    assert_eq!(reason, "ValidationFailed");
    assert!(message.contains("missing"), "message was {message}");
}

#[tokio::test]
async fn test_deleted_distribution_is_ignored() {
    let h = Harness::new();
    let action = h.reconcile("gone", NS).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.mutation_count(), 0);
}

#[tokio::test]
async fn test_deleted_distribution_drops_backoff_state() {
    let h = Harness::new();
    let key = format!("{NS}/gone");
    h.reconciler
        .backoff_states
        .lock()
        .unwrap()
        .insert(key.clone(), BackoffState::new(1, 60));

    h.reconcile("gone", NS).await.unwrap();

    assert!(!h.reconciler.backoff_states.lock().unwrap().contains_key(&key));
}
