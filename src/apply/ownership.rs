//! # Ownership
//!
//! Namespaced objects prove ownership with a controller owner reference to
//! the distribution's UID. Cluster-scoped objects cannot carry one, so they
//! are tagged with managed-by / part-of / owner-namespace labels and, for
//! role bindings, a namespace-qualified name plus the expected subject.
//!
//! The checker is picked once per object from the resolved scope.

use kube::{Resource as _, ResourceExt};
use serde_json::Value;

use super::cluster::ResourceScope;
use super::ApplyError;
use crate::constants::{MANAGED_BY_LABEL, OPERATOR_NAME, OWNER_NAMESPACE_LABEL, PART_OF_LABEL};
use crate::crd::LlamaStackDistribution;
use crate::manifest::{names, Resource};

pub trait OwnershipChecker: Send + Sync {
    /// Stamp ownership markers onto a desired object
    fn claim(&self, desired: &mut Resource, owner: &LlamaStackDistribution)
        -> Result<(), ApplyError>;

    /// Whether `live` belongs to `owner`. `desired` has already been claimed.
    fn is_owned(&self, live: &Resource, desired: &Resource, owner: &LlamaStackDistribution)
        -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NamespacedOwnership;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterScopedOwnership;

#[must_use]
pub fn checker_for(scope: ResourceScope) -> &'static dyn OwnershipChecker {
    match scope {
        ResourceScope::Namespaced => &NamespacedOwnership,
        ResourceScope::Cluster => &ClusterScopedOwnership,
    }
}

impl OwnershipChecker for NamespacedOwnership {
    fn claim(
        &self,
        desired: &mut Resource,
        owner: &LlamaStackDistribution,
    ) -> Result<(), ApplyError> {
        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or_else(|| ApplyError::MissingOwnerIdentity {
                name: owner.name_any(),
            })?;
        let owner_ref = serde_json::to_value(vec![owner_ref])
            .map_err(|e| ApplyError::InvalidObject {
                key: desired.key().to_string(),
                reason: e.to_string(),
            })?;
        if let Some(metadata) = desired
            .as_value_mut()
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.insert("ownerReferences".to_string(), owner_ref);
        }
        Ok(())
    }

    fn is_owned(
        &self,
        live: &Resource,
        _desired: &Resource,
        owner: &LlamaStackDistribution,
    ) -> bool {
        let Some(uid) = owner.uid() else {
            return false;
        };
        live.pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .is_some_and(|refs| {
                refs.iter()
                    .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid.as_str()))
            })
    }
}

impl ClusterScopedOwnership {
    fn expected_labels(owner: &LlamaStackDistribution) -> [(&'static str, String); 3] {
        [
            (MANAGED_BY_LABEL, OPERATOR_NAME.to_string()),
            (PART_OF_LABEL, owner.name_any()),
            (OWNER_NAMESPACE_LABEL, owner.namespace().unwrap_or_default()),
        ]
    }

    /// Namespace-qualified name for role-binding-like objects
    fn expected_name(desired: &Resource, owner: &LlamaStackDistribution) -> String {
        let prefix = names::cluster_name_prefix(owner);
        if desired.name().starts_with(&prefix) {
            desired.name().to_string()
        } else {
            format!("{prefix}{}", desired.name())
        }
    }
}

fn is_role_binding_like(resource: &Resource) -> bool {
    resource.kind().ends_with("RoleBinding")
}

fn subjects(resource: &Resource) -> Vec<(String, String, String)> {
    resource
        .pointer("/subjects")
        .and_then(Value::as_array)
        .map(|subjects| {
            subjects
                .iter()
                .map(|s| {
                    let field = |f: &str| {
                        s.get(f)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    (field("kind"), field("name"), field("namespace"))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl OwnershipChecker for ClusterScopedOwnership {
    fn claim(
        &self,
        desired: &mut Resource,
        owner: &LlamaStackDistribution,
    ) -> Result<(), ApplyError> {
        desired.clear_namespace();
        if let Some(metadata) = desired
            .as_value_mut()
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.remove("ownerReferences");
        }
        for (key, value) in Self::expected_labels(owner) {
            desired.set_label(key, &value);
        }
        if is_role_binding_like(desired) {
            let name = Self::expected_name(desired, owner);
            desired.set_name(&name);
        }
        Ok(())
    }

    fn is_owned(
        &self,
        live: &Resource,
        desired: &Resource,
        owner: &LlamaStackDistribution,
    ) -> bool {
        let labels = live.labels();
        let labels_match = Self::expected_labels(owner)
            .iter()
            .all(|(key, value)| labels.get(*key) == Some(value));
        if !labels_match {
            return false;
        }
        if !is_role_binding_like(desired) {
            return true;
        }
        if live.name() != Self::expected_name(desired, owner) {
            return false;
        }
        let live_subjects = subjects(live);
        subjects(desired)
            .iter()
            .all(|subject| live_subjects.contains(subject))
    }
}
