//! Common test utilities for reconcile integration tests
//!
//! Wires a [`Reconciler`] to an [`InMemoryCluster`] and a canned health
//! probe, so a whole reconcile runs without an API server.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use kube_runtime::controller::Action;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llama_stack_operator::apply::memory::Verb;
use llama_stack_operator::apply::{ClusterClient, InMemoryCluster};
use llama_stack_operator::config::{
    create_shared_operator_config, ControllerConfig, OperatorConfig,
};
use llama_stack_operator::controller::reconciler::{
    reconcile, HealthProbe, HealthProbeError, Reconciler, ReconcilerError, TriggerSource,
};
use llama_stack_operator::controller::watch::DistributionLister;
use llama_stack_operator::crd::{
    LlamaStackDistribution, LlamaStackDistributionStatus, ProviderInfo,
};
use llama_stack_operator::test_support;

pub use llama_stack_operator::test_support::distribution;

pub const SERVER_VERSION: &str = "0.2.23";

/// Health probe answering every endpoint from memory
#[derive(Debug, Default)]
pub struct StaticHealthProbe {
    pub calls: AtomicUsize,
}

impl StaticHealthProbe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn health(&self, _base_url: &str) -> Result<(), HealthProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn providers(&self, _base_url: &str) -> Result<Vec<ProviderInfo>, HealthProbeError> {
        Ok(vec![ProviderInfo {
            api: "inference".to_string(),
            provider_id: "ollama".to_string(),
            provider_type: "remote::ollama".to_string(),
            ..ProviderInfo::default()
        }])
    }

    async fn version(&self, _base_url: &str) -> Result<String, HealthProbeError> {
        Ok(SERVER_VERSION.to_string())
    }
}

/// Lists distributions straight from the in-memory cluster
pub struct ClusterLister(pub Arc<InMemoryCluster>);

#[async_trait]
impl DistributionLister for ClusterLister {
    async fn list(&self) -> Result<Vec<LlamaStackDistribution>, String> {
        self.0
            .objects_of_kind("LlamaStackDistribution")
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(|e| e.to_string()))
            .collect()
    }
}

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub probe: Arc<StaticHealthProbe>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_operator_config(OperatorConfig::default())
    }

    pub fn with_operator_config(operator_config: OperatorConfig) -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        let probe = Arc::new(StaticHealthProbe::default());
        let config = ControllerConfig {
            manifests_dir: test_support::manifests_dir(),
            ..ControllerConfig::default()
        };
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            config,
            create_shared_operator_config(operator_config),
            Arc::clone(&probe) as Arc<dyn HealthProbe>,
        ));
        Self {
            cluster,
            probe,
            reconciler,
        }
    }

    /// Store a distribution as if a user had created it
    pub fn create(&self, dist: &LlamaStackDistribution) {
        let value = serde_json::to_value(dist).expect("distribution serializes");
        self.cluster
            .seed(value)
            .expect("distribution is a valid object");
    }

    /// Store any object, bypassing the mutation log
    pub fn seed(&self, value: Value) {
        self.cluster.seed(value).expect("seeded object is valid");
    }

    /// Edit the stored distribution's spec in place
    pub fn edit_spec(&self, name: &str, namespace: &str, edit: impl FnOnce(&mut Value)) {
        let found = self
            .cluster
            .update_object("LlamaStackDistribution", Some(namespace), name, |object| {
                edit(&mut object["spec"]);
            });
        assert!(found, "distribution {namespace}/{name} exists");
    }

    pub async fn set_operator_config(&self, config: OperatorConfig) {
        *self.reconciler.operator_config.write().await = Arc::new(config);
    }

    pub async fn reconcile(&self, name: &str, namespace: &str) -> Result<Action, ReconcilerError> {
        // Only the identity of the trigger object matters
        let trigger = Arc::new(distribution(name, namespace));
        reconcile(trigger, Arc::clone(&self.reconciler), TriggerSource::Direct).await
    }

    pub fn status(&self, name: &str, namespace: &str) -> LlamaStackDistributionStatus {
        let object = self
            .cluster
            .object("LlamaStackDistribution", Some(namespace), name)
            .expect("distribution exists");
        serde_json::from_value(object["status"].clone()).expect("status deserializes")
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.cluster.object(kind, namespace, name)
    }

    pub fn deployment(&self, name: &str, namespace: &str) -> Value {
        self.object("Deployment", Some(namespace), name)
            .expect("deployment exists")
    }

    /// Simulate the Deployment controller reporting ready pods
    pub fn set_ready_replicas(&self, name: &str, namespace: &str, ready: i64) {
        let found = self
            .cluster
            .update_object("Deployment", Some(namespace), name, |object| {
                object["status"] = serde_json::json!({"readyReplicas": ready});
            });
        assert!(found, "deployment {namespace}/{name} exists");
    }

    /// Mutations other than status writes
    pub fn object_mutations(&self) -> Vec<(Verb, String, String)> {
        self.cluster
            .mutations()
            .into_iter()
            .filter(|m| m.verb != Verb::PatchStatus)
            .map(|m| (m.verb, m.kind, m.name))
            .collect()
    }
}

/// Container image of a rendered Deployment
pub fn deployment_image(deployment: &Value) -> &str {
    deployment
        .pointer("/spec/template/spec/containers/0/image")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub fn pod_annotation<'a>(deployment: &'a Value, annotation: &str) -> Option<&'a str> {
    deployment
        .pointer("/spec/template/metadata/annotations")
        .and_then(|annotations| annotations.get(annotation))
        .and_then(Value::as_str)
}
