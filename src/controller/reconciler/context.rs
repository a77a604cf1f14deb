//! # Manifest Context Builder
//!
//! Resolves what static templates cannot know: the image, the content hashes
//! of referenced configuration, and the pod spec fragment carrying env,
//! volumes, resources, and scheduling overrides.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    ResourceRequirements, TopologySpreadConstraint, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::configmaps::{ConfigMapPlan, MountedConfigMap};
use crate::constants::{
    CA_BUNDLE_MOUNT_PATH, DEFAULT_MOUNT_PATH, USER_CONFIG_KEY, USER_CONFIG_MOUNT_PATH,
};
use crate::controller::catalog::ResolvedDistribution;
use crate::crd::{LlamaStackDistribution, ResourceRequirementsSpec};
use crate::manifest::{names, ManifestContext};

const STORAGE_VOLUME: &str = "lls-storage";
const USER_CONFIG_VOLUME: &str = "user-config";
const CA_BUNDLE_VOLUME: &str = "ca-bundle";

pub fn build_manifest_context(
    dist: &LlamaStackDistribution,
    resolved: &ResolvedDistribution,
    plan: &ConfigMapPlan,
) -> Result<ManifestContext> {
    let pod_spec = build_pod_spec(dist, resolved, plan);
    let mut pod_spec = serde_json::to_value(pod_spec).context("failed to serialize pod spec")?;

    let mut volumes = vec![serde_json::to_value(storage_volume(dist))
        .context("failed to serialize storage volume")?];
    if let Some(user_config) = &plan.user_config {
        volumes.push(config_map_volume(USER_CONFIG_VOLUME, user_config));
    }
    if let Some(ca_bundle) = &plan.ca_bundle {
        volumes.push(config_map_volume(CA_BUNDLE_VOLUME, ca_bundle));
    }
    if let Some(overrides) = &dist.spec.server.pod_overrides {
        volumes.extend(overrides.volumes.iter().cloned());
    }
    if let Some(pod_spec) = pod_spec.as_object_mut() {
        pod_spec.insert("volumes".to_string(), Value::Array(volumes));
    }

    Ok(ManifestContext {
        image: resolved.image.clone(),
        content_hashes: plan.content_hashes.clone(),
        pod_spec,
    })
}

fn build_pod_spec(
    dist: &LlamaStackDistribution,
    resolved: &ResolvedDistribution,
    plan: &ConfigMapPlan,
) -> PodSpec {
    let spec = &dist.spec;
    let overrides = spec.server.pod_overrides.as_ref();
    let mount_path = spec
        .server
        .storage
        .as_ref()
        .map_or(DEFAULT_MOUNT_PATH, |s| s.mount_path.as_str());

    let mut env = vec![env_var("HF_HOME", mount_path)];
    let mut volume_mounts = vec![volume_mount(STORAGE_VOLUME, mount_path, false)];

    if plan.user_config.is_some() {
        env.push(env_var(
            "RUN_CONFIG_PATH",
            &format!("{USER_CONFIG_MOUNT_PATH}/{USER_CONFIG_KEY}"),
        ));
        volume_mounts.push(volume_mount(USER_CONFIG_VOLUME, USER_CONFIG_MOUNT_PATH, true));
    }
    if plan.ca_bundle.is_some() {
        env.push(env_var("SSL_CERT_DIR", CA_BUNDLE_MOUNT_PATH));
        volume_mounts.push(volume_mount(CA_BUNDLE_VOLUME, CA_BUNDLE_MOUNT_PATH, true));
    }

    let container_spec = spec.server.container_spec.as_ref();
    for user_env in container_spec.map(|c| c.env.as_slice()).unwrap_or_default() {
        env.retain(|e| e.name != user_env.name);
        env.push(EnvVar {
            name: user_env.name.clone(),
            value: user_env.value.clone(),
            ..Default::default()
        });
    }
    if let Some(overrides) = overrides {
        volume_mounts.extend(overrides.volume_mounts.iter().map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            read_only: m.read_only,
            sub_path: m.sub_path.clone(),
            ..Default::default()
        }));
    }

    let non_empty = |v: &[String]| (!v.is_empty()).then(|| v.to_vec());
    let container = Container {
        name: spec.container_name().to_string(),
        image: Some(resolved.image.clone()),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        resources: container_spec
            .and_then(|c| c.resources.as_ref())
            .map(resource_requirements),
        command: container_spec.and_then(|c| non_empty(&c.command)),
        args: container_spec.and_then(|c| non_empty(&c.args)),
        ..Default::default()
    };

    let topology_spread_constraints = spec
        .server
        .topology_spread_constraints
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|constraints| {
            constraints
                .iter()
                .map(|c| TopologySpreadConstraint {
                    max_skew: c.max_skew,
                    topology_key: c.topology_key.clone(),
                    when_unsatisfiable: c.when_unsatisfiable.clone(),
                    label_selector: Some(LabelSelector {
                        match_labels: Some(names::selector_labels(dist)),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect()
        });

    PodSpec {
        containers: vec![container],
        service_account_name: Some(names::service_account_name(dist)),
        termination_grace_period_seconds: overrides.and_then(|o| o.termination_grace_period_seconds),
        topology_spread_constraints,
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn volume_mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// The PVC when storage is configured, else scratch space
fn storage_volume(dist: &LlamaStackDistribution) -> Volume {
    if dist.spec.server.storage.is_some() {
        Volume {
            name: STORAGE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: names::pvc_name(dist),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: STORAGE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }
}

fn config_map_volume(volume: &str, mounted: &MountedConfigMap) -> Value {
    let items: Vec<Value> = mounted
        .keys
        .iter()
        .map(|key| json!({"key": key, "path": key}))
        .collect();
    json!({
        "name": volume,
        "configMap": {"name": mounted.name, "items": items}
    })
}

fn resource_requirements(spec: &ResourceRequirementsSpec) -> ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        requests: quantities(&spec.requests),
        limits: quantities(&spec.limits),
        ..Default::default()
    }
}
