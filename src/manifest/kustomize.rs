//! # Kustomization Engine
//!
//! Builds a template directory the way `kustomize build` does for the subset
//! of features the operator's templates use:
//!
//! - `resources` (plain files, or directories holding their own kustomization)
//! - `namespace`
//! - `namePrefix`
//! - `commonLabels`
//! - `commonAnnotations`
//!
//! Everything runs in-process; no external binary is required.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::resource::{Resource, ResourceMap};
use super::RenderError;

/// File names recognised as a kustomization, in lookup order
pub const KUSTOMIZATION_FILE_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Nested kustomizations deeper than this are treated as a cycle
const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
}

/// Locate the kustomization file in `dir`, if any
#[must_use]
pub fn find_kustomization_file(dir: &Path) -> Option<PathBuf> {
    KUSTOMIZATION_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Build the kustomization rooted at `dir` into a [`ResourceMap`]
pub fn build(dir: &Path) -> Result<ResourceMap, RenderError> {
    Ok(build_dir(dir, 0)?.into_iter().collect())
}

fn build_dir(dir: &Path, depth: usize) -> Result<Vec<Resource>, RenderError> {
    if depth > MAX_DEPTH {
        return Err(RenderError::KustomizationDepth {
            path: dir.to_path_buf(),
        });
    }

    let file = find_kustomization_file(dir).ok_or_else(|| RenderError::KustomizationNotFound {
        path: dir.to_path_buf(),
    })?;
    let kustomization = read_kustomization(&file)?;

    let mut resources = Vec::new();
    for entry in &kustomization.resources {
        let path = dir.join(entry);
        if path.is_dir() {
            resources.extend(build_dir(&path, depth + 1)?);
        } else if path.is_file() {
            resources.extend(load_documents(&path)?);
        } else {
            return Err(RenderError::MissingResource { path });
        }
    }

    debug!(
        kustomization = %file.display(),
        resources = resources.len(),
        "Built kustomization"
    );

    for resource in &mut resources {
        apply_kustomization(&kustomization, resource);
    }
    Ok(resources)
}

fn read_kustomization(path: &Path) -> Result<Kustomization, RenderError> {
    let content = std::fs::read_to_string(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| RenderError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse every YAML document in a file. `List` documents are flattened.
pub fn load_documents(path: &Path) -> Result<Vec<Resource>, RenderError> {
    let content = std::fs::read_to_string(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_documents(&content).map_err(|err| match err {
        RenderError::Yaml { source, .. } => RenderError::Yaml {
            path: path.to_path_buf(),
            source,
        },
        RenderError::InvalidResource { reason } => RenderError::InvalidResource {
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })
}

pub(crate) fn parse_documents(content: &str) -> Result<Vec<Resource>, RenderError> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(document).map_err(|source| {
            RenderError::Yaml {
                path: PathBuf::new(),
                source,
            }
        })?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(serde_json::Value::as_str) == Some("List") {
            let items = value
                .get("items")
                .and_then(serde_json::Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                resources.push(Resource::from_value(item)?);
            }
        } else {
            resources.push(Resource::from_value(value)?);
        }
    }
    Ok(resources)
}

fn apply_kustomization(kustomization: &Kustomization, resource: &mut Resource) {
    if let Some(prefix) = kustomization.name_prefix.as_deref().filter(|p| !p.is_empty()) {
        let name = format!("{prefix}{}", resource.name());
        resource.set_name(&name);
    }
    if let Some(namespace) = kustomization.namespace.as_deref().filter(|n| !n.is_empty()) {
        if !super::transform::is_cluster_scoped_kind(resource.kind()) {
            resource.set_namespace(namespace);
        }
    }
    for (key, value) in &kustomization.common_labels {
        resource.set_label(key, value);
    }
    for (key, value) in &kustomization.common_annotations {
        resource.set_annotation(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: service\nspec:\n  ports: []\n";
    const BINDING: &str = "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRoleBinding\nmetadata:\n  name: binding\n";

    #[test]
    fn test_build_nested_kustomization() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir(&base).unwrap();
        fs::write(base.join("service.yaml"), SERVICE).unwrap();
        fs::write(base.join("binding.yaml"), BINDING).unwrap();
        fs::write(
            base.join("kustomization.yaml"),
            "resources:\n- service.yaml\n- binding.yaml\n",
        )
        .unwrap();
        let overlay = dir.path().join("default");
        fs::create_dir(&overlay).unwrap();
        fs::write(
            overlay.join("kustomization.yml"),
            "resources:\n- ../base\nnamespace: team-a\ncommonLabels:\n  tier: api\n",
        )
        .unwrap();

        let map = build(&overlay).unwrap();
        assert_eq!(map.len(), 2);
        let service = map.find_kind("Service").unwrap();
        assert_eq!(service.namespace(), Some("team-a"));
        assert_eq!(service.labels().get("tier").map(String::as_str), Some("api"));
        let binding = map.find_kind("ClusterRoleBinding").unwrap();
        assert_eq!(binding.namespace(), None);
    }

    #[test]
    fn test_missing_resource_names_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("kustomization.yaml"),
            "resources:\n- nope.yaml\n",
        )
        .unwrap();

        match build(dir.path()) {
            Err(RenderError::MissingResource { path }) => {
                assert!(path.ends_with("nope.yaml"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_name_prefix_and_annotations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("service.yaml"), SERVICE).unwrap();
        fs::write(
            dir.path().join("Kustomization"),
            "resources:\n- service.yaml\nnamePrefix: demo-\ncommonAnnotations:\n  owner: platform\n",
        )
        .unwrap();

        let map = build(dir.path()).unwrap();
        let service = map.find_kind("Service").unwrap();
        assert_eq!(service.name(), "demo-service");
        assert_eq!(
            service.annotations().get("owner").map(String::as_str),
            Some("platform")
        );
    }

    #[test]
    fn test_parse_documents_skips_empty_and_flattens_lists() {
        let content = "---\n\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: a\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: b\n";
        let resources = parse_documents(content).unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn test_directory_without_kustomization() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            build(dir.path()),
            Err(RenderError::KustomizationNotFound { .. })
        ));
    }
}
