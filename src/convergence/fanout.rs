//! Fan-out Deleter
//!
//! Runs one ensure-deleted worker per dependent resource, all at once, and
//! waits for every worker before returning. Failures are aggregated; a
//! failing child never stops its siblings.

use crate::convergence::delete::{DeleteConvergence, DeleteTarget};
use crate::convergence::metrics::ConvergenceMetrics;
use crate::domain::ports::ResourceRef;
use crate::error::{Error, Result};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Aggregated Error
// =============================================================================

/// One dependent that failed to converge
#[derive(Debug)]
pub struct ChildFailure {
    pub resource: ResourceRef,
    pub error: Error,
}

/// Every failure of a cascading delete
#[derive(Debug)]
pub struct CascadeError {
    parent: Option<ResourceRef>,
    attempted: usize,
    failures: Vec<ChildFailure>,
}

impl CascadeError {
    pub fn parent(&self) -> Option<&ResourceRef> {
        self.parent.as_ref()
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failures(&self) -> &[ChildFailure] {
        &self.failures
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.resource.id.as_str()).collect()
    }
}

impl std::fmt::Display for CascadeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to delete {} of {} dependent resources",
            self.failures.len(),
            self.attempted
        )?;
        if let Some(parent) = &self.parent {
            write!(f, " of {}", parent)?;
        }
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.resource, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CascadeError {}

// =============================================================================
// Fan-out Deleter
// =============================================================================

/// Concurrent ensure-deleted over a set of dependents
#[derive(Debug, Clone)]
pub struct FanoutDeleter {
    convergence: DeleteConvergence,
    metrics: Arc<ConvergenceMetrics>,
}

impl FanoutDeleter {
    pub fn new(convergence: DeleteConvergence, metrics: Arc<ConvergenceMetrics>) -> Self {
        Self {
            convergence,
            metrics,
        }
    }

    /// Delete every child concurrently, each under its own `per_child_timeout`.
    ///
    /// Returns `Error::Cascade` listing every child that failed.
    pub async fn cascade_delete(
        &self,
        parent: Option<&ResourceRef>,
        children: Vec<Arc<dyn DeleteTarget>>,
        per_child_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attempted = children.len();
        if attempted == 0 {
            return Ok(());
        }
        info!(
            parent = parent.map(|p| p.to_string()).unwrap_or_default(),
            children = attempted,
            "deleting dependent resources"
        );

        // keyed by spawn order, since child ids may repeat
        let mut pending: BTreeMap<usize, ResourceRef> = BTreeMap::new();
        let mut workers = JoinSet::new();
        for (index, child) in children.into_iter().enumerate() {
            let resource = child.resource().clone();
            pending.insert(index, resource.clone());
            let convergence = self.convergence.clone();
            let cancel = cancel.child_token();
            workers.spawn(async move {
                let outcome = AssertUnwindSafe(convergence.ensure_deleted(
                    child.as_ref(),
                    per_child_timeout,
                    &cancel,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(Error::Internal(panic_message(panic.as_ref()))));
                (index, resource, outcome)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, resource, outcome)) => {
                    pending.remove(&index);
                    if let Err(e) = outcome {
                        error!(resource = %resource, error = %e, "failed to delete dependent resource");
                        failures.push(ChildFailure { resource, error: e });
                    }
                }
                Err(e) => {
                    error!(error = %e, "delete worker did not complete");
                }
            }
        }

        // Workers that never reported back still count as failures
        for (_, resource) in pending {
            failures.push(ChildFailure {
                error: Error::Internal(format!("delete worker for {} was lost", resource)),
                resource,
            });
        }

        if failures.is_empty() {
            info!(children = attempted, "all dependent resources deleted");
            return Ok(());
        }

        for failure in &failures {
            self.metrics.record_cascade_failure(failure.resource.kind);
        }
        failures.sort_by(|a, b| a.resource.cmp(&b.resource));
        Err(Error::Cascade(CascadeError {
            parent: parent.cloned(),
            attempted,
            failures,
        }))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("delete worker panicked: {}", detail)
}
