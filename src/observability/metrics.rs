//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `llama_stack_reconciliations_total` - Total number of reconciliations
//! - `llama_stack_reconciliation_errors_total` - Total number of reconciliation errors
//! - `llama_stack_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `llama_stack_apply_operations_total` - Apply decisions by action and kind
//! - `llama_stack_ownership_skips_total` - Objects left alone because another owner holds them
//! - `llama_stack_health_probe_failures_total` - Failed workload health probes by endpoint
//! - `llama_stack_requeues_total` - Requeues by reason
//! - `llama_stack_distributions_by_phase` - Distributions currently in each phase

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "llama_stack_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "llama_stack_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "llama_stack_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static APPLY_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "llama_stack_apply_operations_total",
            "Apply decisions by action and object kind",
        ),
        &["action", "kind"],
    )
    .expect("Failed to create APPLY_OPERATIONS_TOTAL metric - this should never happen")
});

static OWNERSHIP_SKIPS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "llama_stack_ownership_skips_total",
            "Objects skipped because they are not owned by the reconciled distribution",
        ),
        &["kind"],
    )
    .expect("Failed to create OWNERSHIP_SKIPS_TOTAL metric - this should never happen")
});

static HEALTH_PROBE_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "llama_stack_health_probe_failures_total",
            "Failed workload health probes by endpoint",
        ),
        &["endpoint"],
    )
    .expect("Failed to create HEALTH_PROBE_FAILURES_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("llama_stack_requeues_total", "Requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static DISTRIBUTIONS_BY_PHASE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "llama_stack_distributions_by_phase",
            "Phase most recently written for each distribution",
        ),
        &["namespace", "name", "phase"],
    )
    .expect("Failed to create DISTRIBUTIONS_BY_PHASE metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(APPLY_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OWNERSHIP_SKIPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEALTH_PROBE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISTRIBUTIONS_BY_PHASE.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_apply_operations(action: &str, kind: &str) {
    APPLY_OPERATIONS_TOTAL.with_label_values(&[action, kind]).inc();
}

pub fn increment_ownership_skips(kind: &str) {
    OWNERSHIP_SKIPS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_health_probe_failures(endpoint: &str) {
    HEALTH_PROBE_FAILURES_TOTAL.with_label_values(&[endpoint]).inc();
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

/// Record the phase just written, clearing the gauge for other phases
pub fn set_distribution_phase(namespace: &str, name: &str, phase: &str) {
    for candidate in ["Pending", "Initializing", "Ready", "Failed"] {
        let value = i64::from(candidate == phase);
        DISTRIBUTIONS_BY_PHASE
            .with_label_values(&[namespace, name, candidate])
            .set(value);
    }
}
