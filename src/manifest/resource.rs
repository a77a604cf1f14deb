//! # Rendered Resources
//!
//! A rendered object is an untyped document (`serde_json::Value`) with a few
//! typed accessors for the identity fields every Kubernetes object carries.
//! The [`ResourceMap`] keys them by (kind, namespace, name).

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::path::FieldPath;
use super::RenderError;

/// Identity of a rendered object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource(Value);

impl Resource {
    /// Wrap a document, checking it carries `apiVersion`, `kind` and `metadata.name`
    pub fn from_value(value: Value) -> Result<Self, RenderError> {
        let missing = |field: &str| RenderError::InvalidResource {
            reason: format!("document is missing {field}"),
        };
        if !value.is_object() {
            return Err(RenderError::InvalidResource {
                reason: "document is not a map".to_string(),
            });
        }
        if value.get("apiVersion").and_then(Value::as_str).is_none() {
            return Err(missing("apiVersion"));
        }
        if value.get("kind").and_then(Value::as_str).is_none() {
            return Err(missing("kind"));
        }
        if value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(missing("metadata.name"));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn api_version(&self) -> &str {
        self.str_at("/apiVersion").unwrap_or_default()
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        self.str_at("/kind").unwrap_or_default()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.str_at("/metadata/name").unwrap_or_default()
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace")
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.str_at("/metadata/uid")
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.str_at("/metadata/resourceVersion")
    }

    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind().to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut()
            .insert("name".to_string(), Value::String(name.to_string()));
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut().insert(
            "namespace".to_string(),
            Value::String(namespace.to_string()),
        );
    }

    pub fn clear_namespace(&mut self) {
        self.metadata_mut().remove("namespace");
    }

    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.metadata_entry("labels")
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata_entry("annotations")
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    #[must_use]
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        self.0.pointer(path)
    }

    pub fn pointer_mut(&mut self, path: &str) -> Option<&mut Value> {
        self.0.pointer_mut(path)
    }

    /// See [`FieldPath::set`]
    pub fn set_path(
        &mut self,
        path: &FieldPath,
        value: Value,
        create_if_missing: bool,
    ) -> Result<bool, RenderError> {
        path.set(&mut self.0, value, create_if_missing)
            .map_err(|source| RenderError::Path {
                resource: self.key().to_string(),
                source,
            })
    }

    pub fn remove_path(&mut self, path: &FieldPath) -> Option<Value> {
        path.remove(&mut self.0)
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    fn str_at(&self, path: &str) -> Option<&str> {
        self.0.pointer(path).and_then(Value::as_str)
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let root = ensure_object(&mut self.0);
        ensure_object(
            root.entry("metadata")
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }

    fn metadata_entry(&mut self, field: &str) -> &mut Map<String, Value> {
        ensure_object(
            self.metadata_mut()
                .entry(field)
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }
}

/// Coerce a value into a map, replacing anything that is not one
pub(crate) fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Rendered objects for one reconcile, keyed by identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceMap {
    resources: BTreeMap<ResourceKey, Resource>,
}

impl ResourceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, replacing any object with the same identity
    pub fn insert(&mut self, resource: Resource) -> Option<Resource> {
        self.resources.insert(resource.key(), resource)
    }

    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(key)
    }

    /// First resource of the given kind
    #[must_use]
    pub fn find_kind(&self, kind: &str) -> Option<&Resource> {
        self.resources.values().find(|r| r.kind() == kind)
    }

    #[must_use]
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.find_kind(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Rewrite every resource in place, re-keying afterwards since the
    /// closure may change names or namespaces
    pub fn map_resources<F>(self, mut f: F) -> Result<Self, RenderError>
    where
        F: FnMut(&mut Resource) -> Result<(), RenderError>,
    {
        let mut out = Self::new();
        for (_, mut resource) in self.resources {
            f(&mut resource)?;
            out.insert(resource);
        }
        Ok(out)
    }

    /// Split into (matching, rest)
    #[must_use]
    pub fn partition<F>(self, mut predicate: F) -> (Self, Self)
    where
        F: FnMut(&Resource) -> bool,
    {
        let (yes, no): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .resources
            .into_iter()
            .partition(|(_, resource)| predicate(resource));
        (Self { resources: yes }, Self { resources: no })
    }
}

impl FromIterator<Resource> for ResourceMap {
    fn from_iter<T: IntoIterator<Item = Resource>>(iter: T) -> Self {
        let mut map = Self::new();
        for resource in iter {
            map.insert(resource);
        }
        map
    }
}

impl IntoIterator for ResourceMap {
    type Item = Resource;
    type IntoIter = std::collections::btree_map::IntoValues<ResourceKey, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.into_values()
    }
}
