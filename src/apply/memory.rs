//! # In-Memory Cluster
//!
//! A [`ClusterClient`] that keeps objects in a map. It models what the
//! apply engine relies on:
//!
//! - kind scope from a registered REST mapping table
//! - server-side apply as a deep merge that leaves unmentioned fields alone
//! - resource versions that only move when content changes
//! - a log of every mutation
//!
//! Failures can be injected after a number of mutations to simulate a
//! reconcile interrupted half way.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::cluster::{ClusterClient, ClusterError, KindInfo, ResourceScope};
use crate::manifest::path::merge_values;
use crate::manifest::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Apply,
    Delete,
    PatchStatus,
}

/// One recorded change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

type ObjectKey = (String, Option<String>, String);

#[derive(Debug, Default)]
struct State {
    kinds: HashMap<(String, String), KindInfo>,
    objects: BTreeMap<ObjectKey, Value>,
    mutations: Vec<Mutation>,
    fail_after: Option<usize>,
    next_version: u64,
}

#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

const BUILTIN_KINDS: [(&str, &str, &str, ResourceScope); 13] = [
    ("v1", "ConfigMap", "configmaps", ResourceScope::Namespaced),
    ("v1", "Service", "services", ResourceScope::Namespaced),
    ("v1", "ServiceAccount", "serviceaccounts", ResourceScope::Namespaced),
    (
        "v1",
        "PersistentVolumeClaim",
        "persistentvolumeclaims",
        ResourceScope::Namespaced,
    ),
    ("v1", "Namespace", "namespaces", ResourceScope::Cluster),
    ("apps/v1", "Deployment", "deployments", ResourceScope::Namespaced),
    (
        "networking.k8s.io/v1",
        "NetworkPolicy",
        "networkpolicies",
        ResourceScope::Namespaced,
    ),
    (
        "networking.k8s.io/v1",
        "Ingress",
        "ingresses",
        ResourceScope::Namespaced,
    ),
    (
        "autoscaling/v2",
        "HorizontalPodAutoscaler",
        "horizontalpodautoscalers",
        ResourceScope::Namespaced,
    ),
    (
        "policy/v1",
        "PodDisruptionBudget",
        "poddisruptionbudgets",
        ResourceScope::Namespaced,
    ),
    (
        "rbac.authorization.k8s.io/v1",
        "ClusterRoleBinding",
        "clusterrolebindings",
        ResourceScope::Cluster,
    ),
    (
        "rbac.authorization.k8s.io/v1",
        "ClusterRole",
        "clusterroles",
        ResourceScope::Cluster,
    ),
    (
        "llamastack.io/v1alpha1",
        "LlamaStackDistribution",
        "llamastackdistributions",
        ResourceScope::Namespaced,
    ),
];

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// A cluster knowing the built-in kinds the operator renders
    #[must_use]
    pub fn new() -> Self {
        let kinds = BUILTIN_KINDS
            .iter()
            .map(|(api_version, kind, plural, scope)| {
                (
                    ((*api_version).to_string(), (*kind).to_string()),
                    KindInfo::new(api_version, kind, plural, *scope),
                )
            })
            .collect();
        Self {
            state: Mutex::new(State {
                kinds,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a kind so resolving it fails
    pub fn unregister_kind(&self, api_version: &str, kind: &str) {
        self.lock()
            .kinds
            .remove(&(api_version.to_string(), kind.to_string()));
    }

    /// Let the next `count` mutations succeed and fail every one after
    pub fn fail_after(&self, count: usize) {
        self.lock().fail_after = Some(count);
    }

    pub fn clear_failures(&self) {
        self.lock().fail_after = None;
    }

    /// Store an object directly, bypassing the mutation log. Assigns a UID
    /// and resource version when missing.
    pub fn seed(&self, value: Value) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        let mut value = value;
        state.normalize(&mut value);
        state.stamp(&mut value);
        let key = state.key_of(&value);
        state.objects.insert(key, value.clone());
        Resource::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
    }

    /// Current copy of an object
    #[must_use]
    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let state = self.lock();
        let key = state.key(kind, namespace, name);
        state.objects.get(&key).cloned()
    }

    /// All objects of a kind
    #[must_use]
    pub fn objects_of_kind(&self, kind: &str) -> Vec<Value> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Simulate another actor editing an object
    pub fn update_object<F>(&self, kind: &str, namespace: Option<&str>, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.lock();
        let key = state.key(kind, namespace, name);
        let version = state.bump_version();
        match state.objects.get_mut(&key) {
            Some(object) => {
                f(object);
                metadata_mut(object)
                    .insert("resourceVersion".to_string(), Value::String(version));
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations.len()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn is_cluster_scoped(&self, kind: &str) -> bool {
        self.kinds
            .values()
            .any(|info| info.kind() == kind && info.is_cluster_scoped())
    }

    fn key(&self, kind: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
        let namespace = if self.is_cluster_scoped(kind) {
            None
        } else {
            namespace.map(str::to_string)
        };
        (kind.to_string(), namespace, name.to_string())
    }

    fn key_of(&self, value: &Value) -> ObjectKey {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let namespace = value.pointer("/metadata/namespace").and_then(Value::as_str);
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.key(kind, namespace, name)
    }

    /// Cluster-scoped objects are stored without a namespace
    fn normalize(&self, value: &mut Value) {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if self.is_cluster_scoped(&kind) {
            metadata_mut(value).remove("namespace");
        }
    }

    /// Assign server-owned metadata to a new object
    fn stamp(&mut self, value: &mut Value) {
        let version = self.bump_version();
        let metadata = metadata_mut(value);
        metadata
            .entry("uid")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        metadata.insert("resourceVersion".to_string(), Value::String(version));
        metadata
            .entry("creationTimestamp")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
    }

    /// Count a mutation against the injected failure budget
    fn admit(&mut self, verb: Verb, key: &ObjectKey) -> Result<(), ClusterError> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(ClusterError::Other(format!(
                    "injected failure on {verb:?} {}/{}",
                    key.0, key.2
                )));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn record(&mut self, verb: Verb, key: &ObjectKey) {
        self.mutations.push(Mutation {
            verb,
            kind: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
        });
    }

    fn insert_new(&mut self, verb: Verb, mut value: Value) -> Result<Value, ClusterError> {
        let key = self.key_of(&value);
        self.admit(verb, &key)?;
        self.stamp(&mut value);
        self.objects.insert(key.clone(), value.clone());
        self.record(verb, &key);
        Ok(value)
    }
}

fn metadata_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let root = value
        .as_object_mut()
        .unwrap_or_else(|| unreachable!("value is an object"));
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    metadata
        .as_object_mut()
        .unwrap_or_else(|| unreachable!("metadata is an object"))
}

/// RFC 7386 merge patch
fn merge_patch(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(&key);
            } else {
                merge_patch(target.entry(key).or_insert(Value::Null), value);
            }
        }
    }
}

fn to_resource(value: Value) -> Result<Resource, ClusterError> {
    Resource::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn resolve_kind(&self, api_version: &str, kind: &str) -> Result<KindInfo, ClusterError> {
        self.lock()
            .kinds
            .get(&(api_version.to_string(), kind.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::Discovery {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                reason: "kind not registered".to_string(),
            })
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError> {
        let state = self.lock();
        let key = state.key(kind.kind(), namespace, name);
        state.objects.get(&key).cloned().map(to_resource).transpose()
    }

    async fn create(
        &self,
        _kind: &KindInfo,
        resource: &Resource,
        _field_manager: &str,
    ) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        let mut value = resource.as_value().clone();
        state.normalize(&mut value);
        let key = state.key_of(&value);
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: key.0,
                name: key.2,
            });
        }
        to_resource(state.insert_new(Verb::Create, value)?)
    }

    async fn apply(
        &self,
        _kind: &KindInfo,
        resource: &Resource,
        _field_manager: &str,
    ) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        let mut desired = resource.as_value().clone();
        state.normalize(&mut desired);
        let key = state.key_of(&desired);

        let Some(live) = state.objects.get(&key).cloned() else {
            return to_resource(state.insert_new(Verb::Apply, desired)?);
        };

        if let Some(map) = desired.as_object_mut() {
            map.remove("status");
        }
        let metadata = metadata_mut(&mut desired);
        for server_field in ["uid", "resourceVersion", "creationTimestamp"] {
            metadata.remove(server_field);
        }

        let mut merged = live.clone();
        merge_values(&mut merged, desired);
        if merged == live {
            return to_resource(live);
        }

        state.admit(Verb::Apply, &key)?;
        let version = state.bump_version();
        metadata_mut(&mut merged).insert("resourceVersion".to_string(), Value::String(version));
        state.objects.insert(key.clone(), merged.clone());
        state.record(Verb::Apply, &key);
        to_resource(merged)
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = state.key(kind.kind(), namespace, name);
        if !state.objects.contains_key(&key) {
            return Ok(());
        }
        state.admit(Verb::Delete, &key)?;
        state.objects.remove(&key);
        state.record(Verb::Delete, &key);
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = state.key(kind.kind(), namespace, name);
        let Some(object) = state.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound {
                kind: key.0,
                name: key.2,
            });
        };
        let before = object.get("status").cloned();
        let current = object
            .as_object_mut()
            .map(|map| map.entry("status").or_insert(Value::Null));
        if let Some(current) = current {
            merge_patch(current, status);
        }
        if object.get("status").cloned() != before {
            state.record(Verb::PatchStatus, &key);
        }
        Ok(())
    }
}
