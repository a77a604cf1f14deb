//! # Reconciliation Logic
//!
//! One pass over a distribution, always in this order:
//!
//! 1. fetch the distribution by identity; gone means nothing to do
//! 2. validate and plan the referenced ConfigMaps
//! 3. resolve the image and build the manifest context
//! 4. render and filter the templates
//! 5. apply owned ConfigMaps, delete excluded kinds, apply the rest
//! 6. derive and write status, whether or not the steps above failed
//!
//! Validation happens before the first mutation, so invalid input never
//! leaves partially applied objects behind.

use anyhow::Context;
use kube::{Resource as _, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::configmaps::reconcile_config_maps;
use super::context::build_manifest_context;
use super::health::probe_workload;
use super::status::{self, build_status, observe, write_status, Failure, StatusInput};
use super::types::{Reconciler, ReconcilerError, TriggerSource};
use super::validation::ValidationError;
use crate::apply::cluster::get_typed;
use crate::apply::{ApplyAction, ApplyEngine};
use crate::config::OperatorConfig;
use crate::controller::catalog::DistributionCatalog;
use crate::crd::{DistributionPhase, LlamaStackDistribution};
use crate::manifest::{filter_resources, names, render_manifests, FilterOutcome};
use crate::observability::metrics;

/// Reconcile the distribution behind `obj`.
///
/// Errors are handled by the controller's error policy; the status has
/// already been written by the time one is returned.
pub async fn reconcile(
    obj: Arc<LlamaStackDistribution>,
    ctx: Arc<Reconciler>,
    trigger_source: TriggerSource,
) -> Result<Action, ReconcilerError> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    let span = tracing::info_span!(
        "reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = "LlamaStackDistribution",
        trigger = trigger_source.as_str()
    );
    reconcile_internal(&name, &namespace, ctx)
        .instrument(span)
        .await
}

async fn reconcile_internal(
    name: &str,
    namespace: &str,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();
    let cluster = ctx.cluster.as_ref();

    // The watch cache may be stale; only the live object counts
    let dist = get_typed::<LlamaStackDistribution>(
        cluster,
        &LlamaStackDistribution::api_version(&()),
        &LlamaStackDistribution::kind(&()),
        Some(namespace),
        name,
    )
    .await
    .context("failed to fetch LlamaStackDistribution")?;
    let Some(dist) = dist else {
        debug!("LlamaStackDistribution no longer exists, nothing to reconcile");
        ctx.references.remove(namespace, name);
        ctx.forget_backoff(&format!("{namespace}/{name}"));
        return Ok(Action::await_change());
    };
    ctx.references.update(&dist);

    info!(generation = dist.meta().generation, "Reconciling LlamaStackDistribution");

    let operator_config = Arc::clone(&*ctx.operator_config.read().await);
    let catalog = DistributionCatalog::builtin().with_overrides(&operator_config.image_overrides);

    let outcome = apply_desired_state(&ctx, &dist, &operator_config, &catalog).await;
    let failure = outcome.as_ref().err().map(|err| Failure {
        reason: if is_validation_error(err) {
            "ValidationFailed"
        } else {
            "ReconcileFailed"
        },
        message: format!("{err:#}"),
    });

    let observed = observe(cluster, &dist).await;
    let desired = status::desired_replicas(&dist, &observed);
    let phase = status::derive_phase(failure.is_some(), &observed, desired);
    let probe = if phase == DistributionPhase::Ready {
        Some(probe_workload(ctx.health_probe.as_ref(), &names::service_url(&dist)).await)
    } else {
        None
    };
    let new_status = build_status(&StatusInput {
        dist: &dist,
        observed: &observed,
        failure: failure.as_ref(),
        probe: probe.as_ref(),
        catalog: &catalog,
        now: chrono::Utc::now(),
    });
    let status_result = write_status(cluster, &dist, &new_status).await;
    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

    // The reconcile error is the one worth reporting; a status write
    // failure only surfaces when everything else succeeded
    if let Err(err) = outcome {
        if let Err(status_err) = &status_result {
            warn!(error = %format!("{status_err:#}"), "Failed to record failure in status");
        }
        error!(error = %format!("{err:#}"), phase = %phase, "Reconciliation failed");
        return Err(if is_validation_error(&err) {
            ReconcilerError::Validation(format!("{err:#}"))
        } else {
            ReconcilerError::ReconciliationFailed(err)
        });
    }
    status_result?;

    ctx.reset_backoff(&format!("{namespace}/{name}"));
    info!(
        phase = %phase,
        ready = new_status.available_replicas,
        desired,
        duration_ms = start.elapsed().as_millis(),
        "Reconciliation complete"
    );

    Ok(match phase {
        DistributionPhase::Pending | DistributionPhase::Initializing => {
            metrics::increment_requeues_total("initializing");
            Action::requeue(ctx.config.initializing_requeue())
        }
        DistributionPhase::Ready | DistributionPhase::Failed => {
            metrics::increment_requeues_total("resync");
            Action::requeue(ctx.config.resync_interval())
        }
    })
}

/// Steps 2 to 5. Everything that can be rejected is checked before the
/// first write.
async fn apply_desired_state(
    ctx: &Reconciler,
    dist: &LlamaStackDistribution,
    operator_config: &OperatorConfig,
    catalog: &DistributionCatalog,
) -> anyhow::Result<()> {
    let cluster = ctx.cluster.as_ref();

    let plan = async { reconcile_config_maps(cluster, dist).await }
        .instrument(tracing::info_span!("reconcile.configmaps"))
        .await
        .context("failed to reconcile referenced ConfigMaps")?;

    let resolved = catalog
        .resolve(&dist.spec.server.distribution)
        .context("failed to resolve distribution")?;
    let manifest_context = build_manifest_context(dist, &resolved, &plan)
        .context("failed to build manifest context")?;

    let rendered = tracing::info_span!("reconcile.render", image = %resolved.image)
        .in_scope(|| {
            render_manifests(
                &ctx.config.manifests_dir,
                dist,
                &ctx.config.operator_namespace,
                Some(&manifest_context),
            )
        })
        .context("failed to render manifests")?;
    let FilterOutcome { kept, mut excluded } =
        filter_resources(rendered, dist, &operator_config.feature_flags);
    for stale in plan.stale.iter() {
        excluded.insert(stale.clone());
    }

    let engine = ApplyEngine::new(cluster, dist);
    async {
        engine
            .apply_all(&plan.owned)
            .await
            .context("failed to apply owned ConfigMaps")?;
        let deleted = engine
            .delete_excluded(&excluded)
            .await
            .context("failed to delete excluded resources")?;
        let report = engine
            .apply_all(&kept)
            .await
            .context("failed to apply manifests")?;
        debug!(
            created = report.count(ApplyAction::Created),
            patched = report.count(ApplyAction::Patched),
            unchanged = report.count(ApplyAction::Unchanged),
            deleted = deleted.count(ApplyAction::Deleted),
            "Applied desired state"
        );
        anyhow::Ok(())
    }
    .instrument(tracing::info_span!("reconcile.apply"))
    .await
}

fn is_validation_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ValidationError>().is_some()
}
