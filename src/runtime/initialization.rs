//! # Initialization
//!
//! Controller initialization: rustls setup, logging, metrics, server
//! startup, operator configuration and the reconciler context.

use anyhow::{Context, Result};
use futures::channel::mpsc;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::apply::KubeClusterClient;
use crate::config::{
    create_shared_operator_config, load_or_create_operator_config, start_operator_config_watch,
    ControllerConfig,
};
use crate::controller::reconciler::{HttpHealthProbe, Reconciler};
use crate::crd::LlamaStackDistribution;
use crate::observability;
use crate::server::{start_server, ServerState};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    /// All LlamaStackDistributions, cluster-wide
    pub distributions: Api<LlamaStackDistribution>,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    /// Fires after every operator ConfigMap reload
    pub config_reload_rx: mpsc::Receiver<()>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field(
                "server_ready",
                &self
                    .server_state
                    .is_ready
                    .load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
pub fn init_logging(config: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "llama_stack_operator={}",
            config.log_level.to_lowercase()
        ))
    });
    let result = if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(e) = result {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
pub async fn initialize() -> Result<InitializationResult> {
    // Required for rustls 0.23+ before any TLS connection is made
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let config = ControllerConfig::from_env();
    init_logging(&config);

    info!("Starting LlamaStack operator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        namespace = %config.operator_namespace,
        manifests = %config.manifests_dir.display(),
        metrics_port = config.metrics_port,
        "Controller configuration loaded"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let metrics_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let operator_config = load_or_create_operator_config(
        client.clone(),
        &config.operator_namespace,
        &config.operator_config_map,
    )
    .await?;
    let operator_config = create_shared_operator_config(operator_config);
    let (reload_tx, config_reload_rx) = mpsc::channel(1);
    start_operator_config_watch(
        client.clone(),
        &config.operator_namespace,
        &config.operator_config_map,
        Arc::clone(&operator_config),
        reload_tx,
    );

    let health_probe = HttpHealthProbe::new(config.health_probe_timeout())
        .context("Failed to build health probe client")?;
    let distributions: Api<LlamaStackDistribution> = Api::all(client.clone());
    summarize_existing(&distributions).await;

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        config,
        operator_config,
        Arc::new(health_probe),
    ));

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult {
        client,
        distributions,
        reconciler,
        server_state,
        config_reload_rx,
    })
}

/// Wait for the HTTP server to bind
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.server_startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.server_poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log what already exists. The controller's initial list reconciles it.
async fn summarize_existing(distributions: &Api<LlamaStackDistribution>) {
    match distributions.list(&ListParams::default()).await {
        Ok(list) => {
            let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for item in &list.items {
                by_namespace
                    .entry(item.metadata.namespace.clone().unwrap_or_default())
                    .or_default()
                    .push(item.metadata.name.clone().unwrap_or_default());
            }
            info!(
                "CRD is queryable, found {} existing LlamaStackDistribution resources in {} namespaces",
                list.items.len(),
                by_namespace.len()
            );
            for (namespace, mut names) in by_namespace {
                names.sort();
                info!("  {}: {}", namespace, names.join(", "));
            }
        }
        Err(e) => {
            error!("CRD is not queryable: {}. Is the CRD installed?", e);
            error!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            warn!("Continuing, the controller will retry");
        }
    }
}
