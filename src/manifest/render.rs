//! # Manifest Renderer
//!
//! Turns the template directory plus a distribution into a [`ResourceMap`]:
//!
//! 1. kustomization build
//! 2. name prefix (`{name}-`), Deployments excluded so their name stays stable
//! 3. namespace setter
//! 4. field mappings (rule set v1)
//! 5. replica policy: `spec.replicas` is dropped when autoscaling owns it
//! 6. Deployment enrichment from a [`ManifestContext`], when one is given
//!
//! Rendering reads the filesystem and nothing else.

use kube::ResourceExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::context::ManifestContext;
use super::kustomize::{self, find_kustomization_file};
use super::mappings::field_mappings_v1;
use super::path::{merge_values, FieldPath};
use super::resource::{ensure_object, Resource, ResourceMap};
use super::transform::{apply_field_mappings, apply_name_prefix, apply_namespace};
use super::RenderError;
use crate::crd::LlamaStackDistribution;

const DEPLOYMENT_KIND: &str = "Deployment";

/// `dir` itself when it holds a kustomization, else its `default/` subdirectory
pub fn resolve_template_dir(dir: &Path) -> Result<PathBuf, RenderError> {
    if find_kustomization_file(dir).is_some() {
        return Ok(dir.to_path_buf());
    }
    let nested = dir.join("default");
    if find_kustomization_file(&nested).is_some() {
        return Ok(nested);
    }
    Err(RenderError::KustomizationNotFound {
        path: dir.to_path_buf(),
    })
}

pub fn render_manifests(
    template_dir: &Path,
    dist: &LlamaStackDistribution,
    operator_namespace: &str,
    context: Option<&ManifestContext>,
) -> Result<ResourceMap, RenderError> {
    let name = dist.name_any();
    let namespace = dist.namespace().ok_or(RenderError::MissingNamespace)?;
    let dir = resolve_template_dir(template_dir)?;

    let resources = kustomize::build(&dir)?;
    let resources = apply_name_prefix(resources, &name, &[DEPLOYMENT_KIND])?;
    let resources = apply_namespace(resources, &namespace)?;
    let resources = apply_field_mappings(resources, &field_mappings_v1(dist, operator_namespace))?;
    let resources = apply_replica_policy(resources, dist)?;
    let resources = match context {
        Some(context) => enrich_deployment(resources, context)?,
        None => resources,
    };

    debug!(
        resource = %name,
        namespace = %namespace,
        templates = %dir.display(),
        count = resources.len(),
        "Rendered manifests"
    );
    Ok(resources)
}

/// Autoscaled Deployments must not declare `spec.replicas`, otherwise every
/// apply would reset the autoscaler's choice
fn apply_replica_policy(
    resources: ResourceMap,
    dist: &LlamaStackDistribution,
) -> Result<ResourceMap, RenderError> {
    if !dist.spec.autoscaling_enabled() {
        return Ok(resources);
    }
    let replicas = FieldPath::parse("/spec/replicas")?;
    resources.map_resources(|resource| {
        if resource.kind() == DEPLOYMENT_KIND {
            resource.remove_path(&replicas);
        }
        Ok(())
    })
}

fn enrich_deployment(
    resources: ResourceMap,
    context: &ManifestContext,
) -> Result<ResourceMap, RenderError> {
    resources.map_resources(|resource| {
        if resource.kind() == DEPLOYMENT_KIND {
            enrich(resource, context)?;
        }
        Ok(())
    })
}

fn enrich(resource: &mut Resource, context: &ManifestContext) -> Result<(), RenderError> {
    let pod_spec_path = FieldPath::parse("/spec/template/spec")?;
    if pod_spec_path.get(resource.as_value()).is_none() {
        resource.set_path(&pod_spec_path, Value::Object(serde_json::Map::new()), true)?;
    }
    if let Some(pod_spec) = resource.pointer_mut("/spec/template/spec") {
        merge_pod_spec(pod_spec, context.pod_spec.clone());
    }

    if !context.image.is_empty() {
        let image = FieldPath::parse("/spec/template/spec/containers/0/image")?;
        resource.set_path(&image, Value::String(context.image.clone()), true)?;
    }

    for (annotation, hash) in &context.content_hashes {
        let path = FieldPath::parse(&format!(
            "/spec/template/metadata/annotations/{}",
            FieldPath::escape(annotation)
        ))?;
        resource.set_path(&path, Value::String(hash.clone()), true)?;
    }
    Ok(())
}

/// Merge a pod spec fragment into a template pod spec. Containers are
/// matched by name and merged individually so template-only fields such as
/// probes survive; everything else follows [`merge_values`].
fn merge_pod_spec(base: &mut Value, mut overlay: Value) {
    let overlay_containers = overlay
        .as_object_mut()
        .and_then(|o| o.remove("containers"))
        .and_then(|c| match c {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default();

    merge_values(base, overlay);

    let base_map = ensure_object(base);
    let containers = base_map
        .entry("containers")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !containers.is_array() {
        *containers = Value::Array(Vec::new());
    }
    let Value::Array(base_containers) = containers else {
        return;
    };

    for (index, container) in overlay_containers.into_iter().enumerate() {
        let name = container.get("name").and_then(Value::as_str).map(str::to_string);
        let position = name
            .as_deref()
            .and_then(|n| {
                base_containers
                    .iter()
                    .position(|c| c.get("name").and_then(Value::as_str) == Some(n))
            })
            .or_else(|| (name.is_none() && index < base_containers.len()).then_some(index));
        match position {
            Some(pos) => merge_values(&mut base_containers[pos], container),
            None => base_containers.push(container),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::USER_CONFIG_HASH_ANNOTATION;
    use crate::crd::AutoscalingSpec;
    use crate::test_support::{distribution, manifests_dir};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_render_shipped_templates() {
        let dist = distribution("demo", "team-a");
        let map = render_manifests(&manifests_dir(), &dist, "operators", None).unwrap();

        let deployment = map.find_kind("Deployment").unwrap();
        assert_eq!(deployment.name(), "demo");
        assert_eq!(deployment.namespace(), Some("team-a"));
        assert_eq!(deployment.pointer("/spec/replicas"), Some(&json!(1)));
        assert_eq!(
            deployment.pointer("/spec/selector/matchLabels/app.kubernetes.io~1instance"),
            Some(&json!("demo"))
        );
        assert_eq!(
            deployment.pointer("/spec/template/spec/serviceAccountName"),
            Some(&json!("demo-sa"))
        );

        let service = map.find_kind("Service").unwrap();
        assert_eq!(service.name(), "demo-service");
        assert_eq!(service.pointer("/spec/ports/0/port"), Some(&json!(8321)));

        let pvc = map.find_kind("PersistentVolumeClaim").unwrap();
        assert_eq!(pvc.name(), "demo-pvc");

        let crb = map.find_kind("ClusterRoleBinding").unwrap();
        assert_eq!(crb.name(), "team-a-demo-scc-binding");
        assert_eq!(crb.namespace(), None);
        assert_eq!(crb.pointer("/subjects/0/namespace"), Some(&json!("team-a")));

        let policy = map.find_kind("NetworkPolicy").unwrap();
        assert_eq!(
            policy.pointer(
                "/spec/ingress/0/from/1/namespaceSelector/matchLabels/kubernetes.io~1metadata.name"
            ),
            Some(&json!("operators"))
        );
    }

    #[test]
    fn test_template_dir_falls_back_to_default() {
        let root = manifests_dir();
        assert_eq!(resolve_template_dir(&root).unwrap(), root.join("default"));
        let base = root.join("base");
        assert_eq!(resolve_template_dir(&base).unwrap(), base);
    }

    #[test]
    fn test_autoscaling_removes_replicas() {
        let mut dist = distribution("demo", "team-a");
        dist.spec.server.autoscaling = Some(AutoscalingSpec {
            min_replicas: Some(2),
            max_replicas: 5,
            target_cpu_utilization_percentage: None,
            target_memory_utilization_percentage: Some(70),
        });
        let map = render_manifests(&manifests_dir(), &dist, "operators", None).unwrap();

        let deployment = map.find_kind("Deployment").unwrap();
        assert_eq!(deployment.pointer("/spec/replicas"), None);
        let hpa = map.find_kind("HorizontalPodAutoscaler").unwrap();
        assert_eq!(hpa.pointer("/spec/minReplicas"), Some(&json!(2)));
        assert_eq!(hpa.pointer("/spec/maxReplicas"), Some(&json!(5)));
        assert_eq!(
            hpa.pointer("/spec/metrics/0/resource/target/averageUtilization"),
            Some(&json!(80))
        );
        assert_eq!(
            hpa.pointer("/spec/metrics/1/resource/name"),
            Some(&json!("memory"))
        );
    }

    #[test]
    fn test_context_enriches_only_deployment() {
        let dist = distribution("demo", "team-a");
        let context = ManifestContext {
            image: "docker.io/llamastack/distribution-starter:latest".to_string(),
            content_hashes: BTreeMap::from([(
                USER_CONFIG_HASH_ANNOTATION.to_string(),
                "abc123".to_string(),
            )]),
            pod_spec: json!({
                "containers": [{
                    "name": "llama-stack",
                    "env": [{"name": "HF_HOME", "value": "/.llama"}]
                }],
                "volumes": [{"name": "lls-storage", "emptyDir": {}}]
            }),
        };
        let map = render_manifests(&manifests_dir(), &dist, "operators", Some(&context)).unwrap();

        let deployment = map.find_kind("Deployment").unwrap();
        assert_eq!(
            deployment.pointer("/spec/template/spec/containers/0/image"),
            Some(&json!("docker.io/llamastack/distribution-starter:latest"))
        );
        // template probe survives the container merge
        assert!(deployment
            .pointer("/spec/template/spec/containers/0/readinessProbe")
            .is_some());
        assert_eq!(
            deployment.pointer("/spec/template/spec/containers/0/env/0/name"),
            Some(&json!("HF_HOME"))
        );
        assert_eq!(
            deployment.pointer(
                "/spec/template/metadata/annotations/llamastack.io~1user-config-hash"
            ),
            Some(&json!("abc123"))
        );
        let service = map.find_kind("Service").unwrap();
        assert!(service.pointer("/spec/template").is_none());
    }

    #[test]
    fn test_missing_template_file_is_render_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kustomization.yaml"),
            "resources:\n- deployment.yaml\n",
        )
        .unwrap();
        let dist = distribution("demo", "team-a");
        assert!(matches!(
            render_manifests(dir.path(), &dist, "operators", None),
            Err(RenderError::MissingResource { .. })
        ));
    }

    #[test]
    fn test_merge_pod_spec_appends_unknown_containers() {
        let mut base = json!({"containers": [{"name": "a", "image": "x"}]});
        merge_pod_spec(
            &mut base,
            json!({"containers": [{"name": "b", "image": "y"}], "serviceAccountName": "sa"}),
        );
        assert_eq!(base["containers"].as_array().unwrap().len(), 2);
        assert_eq!(base["serviceAccountName"], "sa");
    }
}
