//! # Status State Machine
//!
//! Derives the phase and conditions of a distribution from what the cluster
//! reports, then writes them through the status subresource.
//!
//! ## Phases
//!
//! - **Failed**: the reconcile itself errored
//! - **Pending**: no Deployment observed yet
//! - **Initializing**: ready replicas differ from desired
//! - **Ready**: ready replicas equal desired
//!
//! Conditions are recomputed on every reconcile. A condition keeps its
//! `lastTransitionTime` as long as its status does not change.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::{Resource as _, ResourceExt};
use tracing::{debug, warn};

use super::health::ProbeReport;
use crate::apply::cluster::get_typed;
use crate::apply::ClusterClient;
use crate::controller::catalog::DistributionCatalog;
use crate::crd::{
    Condition, DistributionPhase, LlamaStackDistribution, LlamaStackDistributionStatus,
};
use crate::manifest::names;
use crate::observability::metrics;

pub const DEPLOYMENT_READY: &str = "DeploymentReady";
pub const STORAGE_READY: &str = "StorageReady";
pub const SERVICE_READY: &str = "ServiceReady";
pub const HEALTH_CHECK: &str = "HealthCheck";

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";
const STATUS_UNKNOWN: &str = "Unknown";

/// Live state of the managed workload objects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    pub deployment: Option<DeploymentObservation>,
    pub service_found: bool,
    /// `None` when the claim does not exist
    pub pvc_phase: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentObservation {
    pub ready_replicas: i32,
    /// What the Deployment itself asks for, set by the autoscaler when enabled
    pub spec_replicas: Option<i32>,
}

/// Why the reconcile failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: &'static str,
    pub message: String,
}

pub struct StatusInput<'a> {
    pub dist: &'a LlamaStackDistribution,
    pub observed: &'a ObservedState,
    pub failure: Option<&'a Failure>,
    /// Only present when the phase is Ready
    pub probe: Option<&'a ProbeReport>,
    pub catalog: &'a DistributionCatalog,
    pub now: DateTime<Utc>,
}

/// Read the Deployment, Service and claim of a distribution.
///
/// Read errors are logged and treated as absence, so the phase degrades
/// instead of the reconcile failing twice.
pub async fn observe(cluster: &dyn ClusterClient, dist: &LlamaStackDistribution) -> ObservedState {
    let namespace = dist.namespace();
    let namespace = namespace.as_deref();

    let deployment = get_typed::<Deployment>(
        cluster,
        "apps/v1",
        "Deployment",
        namespace,
        &names::deployment_name(dist),
    )
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read Deployment for status");
        None
    })
    .map(|deployment| DeploymentObservation {
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        spec_replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
    });

    let service_found = get_typed::<Service>(
        cluster,
        "v1",
        "Service",
        namespace,
        &names::service_name(dist),
    )
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read Service for status");
        None
    })
    .is_some();

    let pvc_phase = if dist.spec.server.storage.is_some() {
        get_typed::<PersistentVolumeClaim>(
            cluster,
            "v1",
            "PersistentVolumeClaim",
            namespace,
            &names::pvc_name(dist),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read PersistentVolumeClaim for status");
            None
        })
        .map(|pvc| {
            pvc.status
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Pending".to_string())
        })
    } else {
        None
    };

    ObservedState {
        deployment,
        service_found,
        pvc_phase,
    }
}

/// Replicas the Deployment should converge to
#[must_use]
pub fn desired_replicas(dist: &LlamaStackDistribution, observed: &ObservedState) -> i32 {
    match &dist.spec.server.autoscaling {
        Some(autoscaling) => observed
            .deployment
            .and_then(|d| d.spec_replicas)
            .or(autoscaling.min_replicas)
            .unwrap_or(1),
        None => dist.spec.replicas,
    }
}

#[must_use]
pub fn derive_phase(failed: bool, observed: &ObservedState, desired: i32) -> DistributionPhase {
    if failed {
        return DistributionPhase::Failed;
    }
    match observed.deployment {
        None => DistributionPhase::Pending,
        Some(d) if d.ready_replicas == desired => DistributionPhase::Ready,
        Some(_) => DistributionPhase::Initializing,
    }
}

#[must_use]
pub fn build_status(input: &StatusInput<'_>) -> LlamaStackDistributionStatus {
    let dist = input.dist;
    let previous = dist.status.clone().unwrap_or_default();
    let desired = desired_replicas(dist, input.observed);
    let phase = derive_phase(input.failure.is_some(), input.observed, desired);
    let ready = input.observed.deployment.map_or(0, |d| d.ready_replicas);
    let now = input.now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let transition = |type_: &str, status: &str, reason: &str, message: String| {
        condition(&previous.conditions, type_, status, reason, message, &now)
    };

    let deployment_condition = match (input.failure, input.observed.deployment) {
        (Some(failure), _) => transition(
            DEPLOYMENT_READY,
            STATUS_FALSE,
            failure.reason,
            failure.message.clone(),
        ),
        (None, None) => transition(
            DEPLOYMENT_READY,
            STATUS_FALSE,
            "DeploymentNotFound",
            "Deployment has not been created yet".to_string(),
        ),
        (None, Some(_)) if phase == DistributionPhase::Ready => transition(
            DEPLOYMENT_READY,
            STATUS_TRUE,
            "MinimumReplicasAvailable",
            format!("{ready}/{desired} replicas ready"),
        ),
        (None, Some(_)) => transition(
            DEPLOYMENT_READY,
            STATUS_FALSE,
            "ReplicasNotReady",
            format!("{ready}/{desired} replicas ready"),
        ),
    };

    let storage_condition = match (&dist.spec.server.storage, &input.observed.pvc_phase) {
        (None, _) => transition(
            STORAGE_READY,
            STATUS_TRUE,
            "EphemeralStorage",
            "No persistent storage requested".to_string(),
        ),
        (Some(_), Some(pvc_phase)) if pvc_phase == "Bound" => transition(
            STORAGE_READY,
            STATUS_TRUE,
            "VolumeBound",
            "PersistentVolumeClaim is bound".to_string(),
        ),
        (Some(_), Some(pvc_phase)) => transition(
            STORAGE_READY,
            STATUS_FALSE,
            "VolumeNotBound",
            format!("PersistentVolumeClaim is {pvc_phase}"),
        ),
        (Some(_), None) => transition(
            STORAGE_READY,
            STATUS_FALSE,
            "VolumeNotFound",
            "PersistentVolumeClaim has not been created yet".to_string(),
        ),
    };

    let service_condition = if input.observed.service_found {
        transition(
            SERVICE_READY,
            STATUS_TRUE,
            "ServiceFound",
            format!("Service {} exists", names::service_name(dist)),
        )
    } else {
        transition(
            SERVICE_READY,
            STATUS_FALSE,
            "ServiceNotFound",
            "Service has not been created yet".to_string(),
        )
    };

    let health_condition = match input.probe.map(|p| &p.health) {
        Some(Ok(())) => transition(
            HEALTH_CHECK,
            STATUS_TRUE,
            "HealthCheckPassed",
            "Server reports healthy".to_string(),
        ),
        Some(Err(message)) => transition(
            HEALTH_CHECK,
            STATUS_FALSE,
            "HealthCheckFailed",
            message.clone(),
        ),
        None => transition(
            HEALTH_CHECK,
            STATUS_UNKNOWN,
            "NotReady",
            format!("Health is probed once the distribution is Ready (phase {phase})"),
        ),
    };

    let mut status = LlamaStackDistributionStatus {
        phase,
        conditions: vec![
            deployment_condition,
            storage_condition,
            service_condition,
            health_condition,
        ],
        available_replicas: ready,
        service_url: input
            .observed
            .service_found
            .then(|| names::service_url(dist)),
        distribution_config: previous.distribution_config.clone(),
        version: previous.version.clone(),
        observed_generation: dist.meta().generation,
    };

    let config = &mut status.distribution_config;
    config.available_distributions = input.catalog.images().clone();
    if let Ok(resolved) = input.catalog.resolve(&dist.spec.server.distribution) {
        config.active_distribution = Some(resolved.active);
    }
    config.providers = input
        .probe
        .and_then(|p| p.providers.clone())
        .unwrap_or_default();

    let version = &mut status.version;
    version.operator_version = Some(env!("CARGO_PKG_VERSION").to_string());
    if let Some(server_version) = input.probe.and_then(|p| p.version.clone()) {
        if version.server_version.as_ref() != Some(&server_version) {
            version.server_version = Some(server_version);
            version.last_updated = Some(now.clone());
        }
    }

    status
}

fn condition(
    previous: &[Condition],
    condition_type: &str,
    status: &str,
    reason: &str,
    message: String,
    now: &str,
) -> Condition {
    let last_transition_time = previous
        .iter()
        .find(|c| c.r#type == condition_type && c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(last_transition_time),
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Write the status if it differs from what the distribution carries.
///
/// Returns whether a write happened.
pub async fn write_status(
    cluster: &dyn ClusterClient,
    dist: &LlamaStackDistribution,
    status: &LlamaStackDistributionStatus,
) -> Result<bool> {
    let name = dist.name_any();
    let namespace = dist.namespace();
    metrics::set_distribution_phase(
        namespace.as_deref().unwrap_or_default(),
        &name,
        status.phase.as_str(),
    );

    if dist.status.as_ref() == Some(status) {
        debug!(resource = %name, phase = %status.phase, "Status unchanged, skipping update");
        return Ok(false);
    }

    let kind = cluster
        .resolve_kind(
            &LlamaStackDistribution::api_version(&()),
            &LlamaStackDistribution::kind(&()),
        )
        .await
        .context("failed to resolve LlamaStackDistribution kind")?;
    let value = serde_json::to_value(status).context("failed to serialize status")?;
    cluster
        .patch_status(&kind, namespace.as_deref(), &name, value)
        .await
        .with_context(|| format!("failed to update status of {name}"))?;
    debug!(resource = %name, phase = %status.phase, "Status updated");
    Ok(true)
}
