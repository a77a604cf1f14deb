//! # Watch Loop
//!
//! Runs the controller over three trigger sources:
//!
//! - distribution events whose spec changed
//! - changes to ConfigMaps a distribution references
//! - operator ConfigMap reloads, which reconcile every distribution
//!
//! The stream is restarted when it ends, until shutdown is requested.

use futures::channel::mpsc;
use futures::{future, stream, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::{Client, Resource as _, ResourceExt};
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{watcher, Controller, WatchStreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn, Instrument};

use crate::controller::reconciler::{reconcile, Reconciler, TriggerSource};
use crate::controller::watch::{Affected, ReferenceResolver, SpecChangePredicate};
use crate::crd::LlamaStackDistribution;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::server::ServerState;

const BACKOFF_START_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 30_000;

type ReloadSlot = Arc<Mutex<Option<mpsc::Sender<()>>>>;

/// Run the controller until shutdown
pub async fn run_watch_loop(
    client: Client,
    distributions: Api<LlamaStackDistribution>,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config_reload_rx: mpsc::Receiver<()>,
) -> Result<(), anyhow::Error> {
    let shutting_down = Arc::new(AtomicBool::new(false));
    {
        let server_state = Arc::clone(&server_state);
        let shutting_down = Arc::clone(&shutting_down);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal, initiating graceful shutdown...");
            shutting_down.store(true, Ordering::Relaxed);
            server_state.is_ready.store(false, Ordering::Relaxed);
            info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
        });
    }

    // Reloads outlive any single controller run, so each run gets its own receiver
    let reload_slot: ReloadSlot = Arc::new(Mutex::new(None));
    forward_reloads(config_reload_rx, Arc::clone(&reload_slot));

    let backoff_ms = Arc::new(AtomicU64::new(BACKOFF_START_MS));
    let restart_delay = reconciler.config.watch_restart_delay();

    loop {
        if shutting_down.load(Ordering::Relaxed) {
            break;
        }

        info!("Starting controller watch loop...");

        let (reload_tx, reload_rx) = mpsc::channel(1);
        *reload_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(reload_tx);

        let (reader, writer) = reflector::store::<LlamaStackDistribution>();
        let trigger = distribution_events(&distributions, writer, &reconciler);
        let configmap_triggers = configmap_triggers(
            Api::all(client.clone()),
            ReferenceResolver::new(
                reconciler.references.clone(),
                Arc::new(distributions.clone()),
            ),
            reader.clone(),
        );

        let backoff = Arc::clone(&backoff_ms);
        let watch_restart_delay_secs = restart_delay.as_secs();
        Controller::for_stream(trigger, reader)
            .with_config(
                controller::Config::default()
                    .concurrency(reconciler.config.max_concurrent_reconciliations),
            )
            .reconcile_on(configmap_triggers)
            .reconcile_all_on(reload_rx)
            .shutdown_on_signal()
            .run(
                |obj, ctx| reconcile(obj, ctx, TriggerSource::Controller),
                handle_reconciliation_error,
                Arc::clone(&reconciler),
            )
            .filter_map(move |result| {
                let backoff = Arc::clone(&backoff);
                async move {
                    match &result {
                        Ok((object, action)) => {
                            backoff.store(BACKOFF_START_MS, Ordering::Relaxed);
                            log_reconciled(object, action);
                            Some(())
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            handle_watch_stream_error(
                                &error_string,
                                &backoff,
                                BACKOFF_MAX_MS,
                                watch_restart_delay_secs,
                            )
                            .await
                        }
                    }
                }
            })
            .for_each(|()| future::ready(()))
            .instrument(tracing::info_span!("controller.watch", operation = "watch_loop"))
            .await;

        if shutting_down.load(Ordering::Relaxed) {
            break;
        }
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            restart_delay.as_secs()
        );
        tokio::time::sleep(restart_delay).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

fn log_reconciled(object: &ObjectRef<LlamaStackDistribution>, action: &Action) {
    debug!(
        resource.name = %object.name,
        resource.namespace = object.namespace.as_deref().unwrap_or_default(),
        action = ?action,
        "watch.event.reconciled"
    );
}

fn forward_reloads(mut config_reload_rx: mpsc::Receiver<()>, slot: ReloadSlot) {
    tokio::spawn(async move {
        while config_reload_rx.next().await.is_some() {
            info!("Operator configuration changed, reconciling all distributions");
            if let Some(tx) = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_mut()
            {
                // A full channel already has a reload pending
                let _ = tx.try_send(());
            }
        }
    });
}

/// Distribution events that carry a spec change, with the reference index
/// kept in step along the way
fn distribution_events(
    distributions: &Api<LlamaStackDistribution>,
    writer: reflector::store::Writer<LlamaStackDistribution>,
    reconciler: &Reconciler,
) -> impl Stream<Item = Result<LlamaStackDistribution, watcher::Error>> + Send + 'static {
    let predicate = Arc::new(SpecChangePredicate::new());
    let forget = Arc::clone(&predicate);
    let index = reconciler.references.clone();

    watcher(distributions.clone(), watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .inspect_ok(move |event| {
            index.apply_event(event);
            if let watcher::Event::Delete(dist) = event {
                forget.forget(&dist.namespace().unwrap_or_default(), &dist.name_any());
            }
        })
        .applied_objects()
        .try_filter(move |dist| future::ready(predicate.evaluate(dist).should_reconcile()))
}

/// Distributions to reconcile because a ConfigMap they read changed
fn configmap_triggers(
    configmaps: Api<ConfigMap>,
    resolver: ReferenceResolver,
    store: Store<LlamaStackDistribution>,
) -> impl Stream<Item = ObjectRef<LlamaStackDistribution>> + Send + 'static {
    watcher(configmaps, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| {
            future::ready(match event {
                // The initial listing is not a change
                Ok(watcher::Event::Apply(cm) | watcher::Event::Delete(cm)) => {
                    (!is_operator_owned(&cm)).then_some(cm)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "ConfigMap watch error");
                    None
                }
            })
        })
        .then(move |cm| {
            let resolver = resolver.clone();
            let store = store.clone();
            async move {
                let namespace = cm.namespace().unwrap_or_default();
                let name = cm.name_any();
                match resolver.affected_by(&namespace, &name).await {
                    Affected::Some(owners) => {
                        if !owners.is_empty() {
                            info!(
                                configmap = %format!("{namespace}/{name}"),
                                distributions = owners.len(),
                                "Referenced ConfigMap changed"
                            );
                        }
                        owners
                    }
                    Affected::All => store
                        .state()
                        .iter()
                        .map(|dist| ObjectRef::from_obj(dist.as_ref()))
                        .collect(),
                }
            }
        })
        .flat_map(stream::iter)
}

/// Mirrors and inline configs are written by the operator itself
fn is_operator_owned(cm: &ConfigMap) -> bool {
    cm.owner_references()
        .iter()
        .any(|owner| owner.kind == LlamaStackDistribution::kind(&()))
}
