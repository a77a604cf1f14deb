//! # Types
//!
//! Core types for the reconciler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::health::HealthProbe;
use crate::apply::ClusterClient;
use crate::config::{ControllerConfig, SharedOperatorConfig};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::watch::ReferenceIndex;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Invalid input that only a spec or ConfigMap change can fix
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// Who asked for a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Scheduled by the controller: spec change, referenced ConfigMap,
    /// operator config reload, requeue or error backoff
    Controller,
    /// Called outside the controller, e.g. the startup pass
    Direct,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Controller => "controller",
            TriggerSource::Direct => "direct",
        }
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_seconds, max_seconds),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context of every reconciliation
#[derive(Clone)]
pub struct Reconciler {
    /// All cluster reads and writes of a reconcile go through here
    pub cluster: Arc<dyn ClusterClient>,
    pub config: Arc<ControllerConfig>,
    /// Swapped wholesale when the operator ConfigMap changes
    pub operator_config: SharedOperatorConfig,
    pub health_probe: Arc<dyn HealthProbe>,
    /// ConfigMap references of every known distribution
    pub references: ReferenceIndex,
    // Backoff state per resource (identified by namespace/name)
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: ControllerConfig,
        operator_config: SharedOperatorConfig,
        health_probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            cluster,
            config: Arc::new(config),
            operator_config,
            health_probe,
            references: ReferenceIndex::default(),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forget the error history of a resource after a clean reconcile
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }

    /// Drop the error history of a resource that no longer exists
    pub fn forget_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }
}
