//! # LlamaStack Operator
//!
//! A Kubernetes operator that runs Llama Stack servers from
//! `LlamaStackDistribution` resources.
//!
//! For every distribution it renders the bundled kustomize templates with
//! values from the spec, applies the result with owner references, and
//! reports deployment, storage, service and server health in the status.
//!
//! ## Configuration
//!
//! Process settings come from environment variables (see
//! [`ControllerConfig`](llama_stack_operator::config::ControllerConfig)).
//! Feature flags and image overrides come from the operator ConfigMap and
//! are reloaded without a restart.

use anyhow::Result;
use llama_stack_operator::runtime::{initialization, watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialization::initialize().await?;

    watch_loop::run_watch_loop(
        init.client,
        init.distributions,
        init.reconciler,
        init.server_state,
        init.config_reload_rx,
    )
    .await
}
