//! # Field-Mapping Transformer
//!
//! Declarative rules that write computed values into rendered templates:
//! each [`FieldMapping`] names a target kind, a path, an optional value and
//! an optional default. The same rule list runs over every resource, so no
//! per-kind code is needed to inject ports, names or replica counts.
//!
//! Also hosts the two structural passes the renderer runs before mappings:
//! the name-prefix pass and the namespace setter.

use serde_json::Value;
use tracing::trace;

use super::path::FieldPath;
use super::resource::ResourceMap;
use super::RenderError;

/// Kinds that never carry `metadata.namespace`
pub const CLUSTER_SCOPED_KINDS: [&str; 7] = [
    "ClusterRoleBinding",
    "ClusterRole",
    "Namespace",
    "PersistentVolume",
    "StorageClass",
    "CustomResourceDefinition",
    "PriorityClass",
];

#[must_use]
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// One value-injection rule
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub target_kind: String,
    pub target_path: String,
    pub value: Option<Value>,
    pub default_value: Option<Value>,
    pub create_if_missing: bool,
}

impl FieldMapping {
    pub fn new(target_kind: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            target_kind: target_kind.into(),
            target_path: target_path.into(),
            value: None,
            default_value: None,
            create_if_missing: false,
        }
    }

    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the value only when present
    #[must_use]
    pub fn value_opt<T: Into<Value>>(mut self, value: Option<T>) -> Self {
        self.value = value.map(Into::into);
        self
    }

    #[must_use]
    pub fn default(mut self, default: impl Into<Value>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    #[must_use]
    pub fn create_if_missing(mut self) -> Self {
        self.create_if_missing = true;
        self
    }

    /// The value to write: the explicit value unless it is null or an empty
    /// string, else the default
    #[must_use]
    pub fn resolved_value(&self) -> Option<&Value> {
        self.value
            .as_ref()
            .filter(|v| !is_empty_value(v))
            .or(self.default_value.as_ref())
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Apply every mapping to every resource of its target kind
pub fn apply_field_mappings(
    resources: ResourceMap,
    mappings: &[FieldMapping],
) -> Result<ResourceMap, RenderError> {
    let parsed = mappings
        .iter()
        .map(|m| {
            FieldPath::parse(&m.target_path)
                .map(|path| (m, path))
                .map_err(|source| RenderError::Path {
                    resource: m.target_kind.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    resources.map_resources(|resource| {
        for (mapping, path) in &parsed {
            if resource.kind() != mapping.target_kind {
                continue;
            }
            let Some(value) = mapping.resolved_value() else {
                continue;
            };
            let applied = resource.set_path(path, value.clone(), mapping.create_if_missing)?;
            trace!(
                resource = %resource.key(),
                path = %path,
                applied,
                "Field mapping"
            );
        }
        Ok(())
    })
}

/// Prefix every name with `{prefix}-`, except resources whose kind is listed
pub fn apply_name_prefix(
    resources: ResourceMap,
    prefix: &str,
    excluded_kinds: &[&str],
) -> Result<ResourceMap, RenderError> {
    resources.map_resources(|resource| {
        if !excluded_kinds.contains(&resource.kind()) {
            let name = format!("{prefix}-{}", resource.name());
            resource.set_name(&name);
        }
        Ok(())
    })
}

/// Set `metadata.namespace` on namespaced kinds and strip it from cluster-scoped ones
pub fn apply_namespace(resources: ResourceMap, namespace: &str) -> Result<ResourceMap, RenderError> {
    resources.map_resources(|resource| {
        if is_cluster_scoped_kind(resource.kind()) {
            resource.clear_namespace();
        } else {
            resource.set_namespace(namespace);
        }
        Ok(())
    })
}
