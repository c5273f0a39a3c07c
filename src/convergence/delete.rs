//! Delete Convergence
//!
//! Drives a resource to "absent": delete, wait for the 404, and when the
//! control plane parks the resource in an error state, reset it to the
//! `error` baseline and delete again. A single deadline started on entry
//! bounds the whole loop, including conflict and retry sleeps.

use crate::convergence::classify::{DELETED, ERROR_BASELINE};
use crate::convergence::metrics::ConvergenceMetrics;
use crate::convergence::poller::StatusPoller;
use crate::domain::ports::{ReplicaBackend, ResourceBackend, ResourceKind, ResourceRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default pause between two delete cycles
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

// =============================================================================
// Delete Targets
// =============================================================================

/// The three operations the ensure-deleted loop needs for one resource
#[async_trait]
pub trait DeleteTarget: Send + Sync {
    fn resource(&self) -> &ResourceRef;

    /// Issue one delete call
    async fn delete(&self) -> Result<()>;

    /// Wait until the resource is gone, errors out, or `deadline` passes
    async fn check_deleted(
        &self,
        poller: &StatusPoller,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Force the status back to a baseline the control plane deletes from
    async fn reset_to_error_baseline(&self) -> Result<()>;
}

/// Delete target backed by a [`ResourceBackend`]
pub struct BackendTarget {
    backend: Arc<dyn ResourceBackend>,
    resource: ResourceRef,
}

impl BackendTarget {
    pub fn new(backend: Arc<dyn ResourceBackend>, id: impl Into<String>) -> Self {
        let resource = ResourceRef::new(backend.kind(), id);
        Self { backend, resource }
    }
}

#[async_trait]
impl DeleteTarget for BackendTarget {
    fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    async fn delete(&self) -> Result<()> {
        let result = self.backend.delete(&self.resource.id).await;
        if let Err(e) = &result {
            info!(resource = %self.resource, error = %e, "delete call failed");
        }
        result
    }

    async fn check_deleted(
        &self,
        poller: &StatusPoller,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let backend = &self.backend;
        let id = self.resource.id.as_str();
        poller
            .await_status_until(&self.resource, &[DELETED], deadline, cancel, || {
                backend.get(id)
            })
            .await
            .map(|_| ())
    }

    async fn reset_to_error_baseline(&self) -> Result<()> {
        info!(resource = %self.resource, "resetting status and trying again");
        self.backend
            .reset_status(&self.resource.id, ERROR_BASELINE)
            .await
    }
}

/// Delete target backed by a [`ReplicaBackend`]
pub struct ReplicaTarget {
    backend: Arc<dyn ReplicaBackend>,
    resource: ResourceRef,
}

impl ReplicaTarget {
    pub fn new(backend: Arc<dyn ReplicaBackend>, replica_id: impl Into<String>) -> Self {
        Self {
            backend,
            resource: ResourceRef::new(ResourceKind::Replica, replica_id),
        }
    }
}

#[async_trait]
impl DeleteTarget for ReplicaTarget {
    fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    async fn delete(&self) -> Result<()> {
        let result = self.backend.delete_replica(&self.resource.id).await;
        if let Err(e) = &result {
            info!(resource = %self.resource, error = %e, "delete call failed");
        }
        result
    }

    async fn check_deleted(
        &self,
        poller: &StatusPoller,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let backend = &self.backend;
        let id = self.resource.id.as_str();
        poller
            .await_status_until(&self.resource, &[DELETED], deadline, cancel, || {
                backend.get_replica(id)
            })
            .await
            .map(|_| ())
    }

    async fn reset_to_error_baseline(&self) -> Result<()> {
        info!(resource = %self.resource, "resetting replica status and trying again");
        self.backend
            .reset_replica_status(&self.resource.id, ERROR_BASELINE)
            .await
    }
}

// =============================================================================
// Delete Mode
// =============================================================================

/// How a single resource removal is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Run the ensure-deleted loop
    Ensure,
    /// One delete call; NotFound counts as success
    BestEffort,
}

impl DeleteMode {
    pub fn from_flag(ensure_deleted: bool) -> Self {
        if ensure_deleted {
            DeleteMode::Ensure
        } else {
            DeleteMode::BestEffort
        }
    }
}

// =============================================================================
// Delete Convergence
// =============================================================================

/// The ensure-deleted protocol
#[derive(Debug, Clone)]
pub struct DeleteConvergence {
    poller: StatusPoller,
    retry_delay: Duration,
    metrics: Arc<ConvergenceMetrics>,
}

impl DeleteConvergence {
    pub fn new(poller: StatusPoller, retry_delay: Duration, metrics: Arc<ConvergenceMetrics>) -> Self {
        Self {
            poller,
            retry_delay,
            metrics,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Delete `target` and keep recovering until it is gone or `timeout` elapses.
    ///
    /// There is no attempt cap: a resource that keeps falling back into an
    /// error state is reset and retried until the deadline.
    pub async fn ensure_deleted(
        &self,
        target: &dyn DeleteTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resource = target.resource();
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(self.timed_out(resource, timeout));
            }
            attempt += 1;
            self.metrics.record_delete_attempt(resource.kind);
            debug!(resource = %resource, attempt, "requesting delete");

            match self.bounded(resource, deadline, timeout, cancel, target.delete()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!(resource = %resource, "resource is already deleted");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(resource = %resource, attempt, error = %e, "delete conflicts, retrying");
                    self.pause(resource, deadline, timeout, cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let checked = self
                .bounded(
                    resource,
                    deadline,
                    timeout,
                    cancel,
                    target.check_deleted(&self.poller, deadline, cancel),
                )
                .await;
            match checked {
                Ok(()) => {
                    info!(resource = %resource, attempt, "resource is deleted");
                    return Ok(());
                }
                Err(e) if e.is_error_state() => {
                    warn!(resource = %resource, attempt, error = %e, "delete left resource in error state");
                }
                // the poller already counted it; report the overall timer
                Err(e) if e.is_timeout() => {
                    return Err(Error::Timeout {
                        resource: resource.clone(),
                        timeout,
                    });
                }
                Err(e) => return Err(e),
            }

            self.metrics.record_reset(resource.kind);
            match self
                .bounded(resource, deadline, timeout, cancel, target.reset_to_error_baseline())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!(resource = %resource, "resource disappeared during reset");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            self.pause(resource, deadline, timeout, cancel).await?;
        }
    }

    /// Remove a resource through its backend according to `mode`
    pub async fn remove(
        &self,
        backend: Arc<dyn ResourceBackend>,
        id: &str,
        mode: DeleteMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match mode {
            DeleteMode::Ensure => {
                let target = BackendTarget::new(backend, id);
                info!(resource = %target.resource(), "waiting for resource to be deleted");
                self.ensure_deleted(&target, timeout, cancel).await
            }
            DeleteMode::BestEffort => {
                let resource = ResourceRef::new(backend.kind(), id);
                let deadline = Instant::now() + timeout;
                match self
                    .bounded(&resource, deadline, timeout, cancel, backend.delete(id))
                    .await
                {
                    Err(e) if e.is_not_found() => {
                        info!(resource = %resource, "resource is already deleted");
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    /// Run one remote call under the shared deadline
    async fn bounded<T>(
        &self,
        resource: &ResourceRef,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled { resource: resource.clone() }),
            outcome = timeout_at(deadline, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(self.timed_out(resource, timeout)),
            },
        }
    }

    /// Sleep the retry delay, clipped to the deadline
    async fn pause(
        &self,
        resource: &ResourceRef,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wake = (Instant::now() + self.retry_delay).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled { resource: resource.clone() }),
            _ = sleep_until(wake) => {}
        }
        if wake >= deadline {
            return Err(self.timed_out(resource, timeout));
        }
        Ok(())
    }

    fn timed_out(&self, resource: &ResourceRef, timeout: Duration) -> Error {
        self.metrics.record_timeout(resource.kind);
        Error::Timeout {
            resource: resource.clone(),
            timeout,
        }
    }
}
