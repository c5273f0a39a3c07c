//! Convergence Metrics
//!
//! Prometheus counters for polling, delete retries, resets, timeouts, fan-out
//! failures and migrations. Each instance owns its own registry.

use crate::domain::ports::ResourceKind;
use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Migration outcome label values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Noop,
    Migrated,
    Failed,
}

impl MigrationOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            MigrationOutcome::Noop => "noop",
            MigrationOutcome::Migrated => "migrated",
            MigrationOutcome::Failed => "failed",
        }
    }
}

/// Counters exported by the engine
#[derive(Debug, Clone)]
pub struct ConvergenceMetrics {
    registry: Registry,
    status_polls: IntCounterVec,
    delete_attempts: IntCounterVec,
    status_resets: IntCounterVec,
    timeouts: IntCounterVec,
    cascade_failures: IntCounterVec,
    migrations: IntCounterVec,
}

impl ConvergenceMetrics {
    /// Create and register all counters in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let status_polls = counter_vec(
            &registry,
            "storage_convergence_status_polls_total",
            "Status observations made while waiting for a resource",
            "kind",
        )?;
        let delete_attempts = counter_vec(
            &registry,
            "storage_convergence_delete_attempts_total",
            "Delete calls issued by the ensure-deleted loop",
            "kind",
        )?;
        let status_resets = counter_vec(
            &registry,
            "storage_convergence_status_resets_total",
            "Status resets issued to recover from error states",
            "kind",
        )?;
        let timeouts = counter_vec(
            &registry,
            "storage_convergence_timeouts_total",
            "Waits that exhausted their deadline",
            "kind",
        )?;
        let cascade_failures = counter_vec(
            &registry,
            "storage_convergence_cascade_failures_total",
            "Dependent resources that failed to delete during a cascade",
            "kind",
        )?;
        let migrations = counter_vec(
            &registry,
            "storage_convergence_migrations_total",
            "Availability zone migrations by outcome",
            "outcome",
        )?;

        Ok(Self {
            registry,
            status_polls,
            delete_attempts,
            status_resets,
            timeouts,
            cascade_failures,
            migrations,
        })
    }

    pub fn record_poll(&self, kind: ResourceKind) {
        self.status_polls.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_delete_attempt(&self, kind: ResourceKind) {
        self.delete_attempts.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_reset(&self, kind: ResourceKind) {
        self.status_resets.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_timeout(&self, kind: ResourceKind) {
        self.timeouts.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_cascade_failure(&self, kind: ResourceKind) {
        self.cascade_failures.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_migration(&self, outcome: MigrationOutcome) {
        self.migrations.with_label_values(&[outcome.as_label()]).inc();
    }

    pub fn polls(&self, kind: ResourceKind) -> u64 {
        self.status_polls.with_label_values(&[kind.as_label()]).get()
    }

    pub fn delete_attempts(&self, kind: ResourceKind) -> u64 {
        self.delete_attempts.with_label_values(&[kind.as_label()]).get()
    }

    pub fn resets(&self, kind: ResourceKind) -> u64 {
        self.status_resets.with_label_values(&[kind.as_label()]).get()
    }

    pub fn timeouts(&self, kind: ResourceKind) -> u64 {
        self.timeouts.with_label_values(&[kind.as_label()]).get()
    }

    pub fn cascade_failures(&self, kind: ResourceKind) -> u64 {
        self.cascade_failures.with_label_values(&[kind.as_label()]).get()
    }

    pub fn migrations(&self, outcome: MigrationOutcome) -> u64 {
        self.migrations.with_label_values(&[outcome.as_label()]).get()
    }

    /// Render all counters in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
