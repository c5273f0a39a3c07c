//! Resource-state convergence engine
//!
//! Waits for remote resources to settle, deletes them with error-state
//! recovery, fans deletes out over dependents and relocates resources across
//! availability zones.
//!
//! ```text
//!        AzMigrator ───────────────┐
//!            │                     ▼
//!  FanoutDeleter ──▶ DeleteConvergence ──▶ StatusPoller ──▶ fetch()
//!                          │
//!                          └──▶ delete() / reset_to_error_baseline()
//! ```

pub mod classify;
pub mod delete;
pub mod fanout;
pub mod metrics;
pub mod migrate;
pub mod poller;

pub use classify::{classify_status, StatusClass, DELETED, ERROR_BASELINE};
pub use delete::{BackendTarget, DeleteConvergence, DeleteMode, DeleteTarget, ReplicaTarget};
pub use fanout::{CascadeError, ChildFailure, FanoutDeleter};
pub use metrics::ConvergenceMetrics;
pub use migrate::{
    AzMigrator, MigrationReport, MigrationState, MigrationStep, MigrationTimeouts, Relocation,
};
pub use poller::StatusPoller;

use crate::config::EngineConfig;
use crate::domain::ports::{ManagedResource, ReplicaBackend, ResourceBackend, ResourceRef};
use crate::error::{Error, Result};
use classify::Observed;
use migrate::is_active;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Entry point bundling the convergence primitives under one configuration
#[derive(Debug, Clone)]
pub struct ConvergenceEngine {
    poller: StatusPoller,
    deleter: DeleteConvergence,
    fanout: FanoutDeleter,
    metrics: Arc<ConvergenceMetrics>,
}

impl ConvergenceEngine {
    pub fn new(config: &EngineConfig, metrics: Arc<ConvergenceMetrics>) -> Self {
        let poller = StatusPoller::new(config.poll_interval, metrics.clone());
        let deleter = DeleteConvergence::new(poller.clone(), config.retry_delay, metrics.clone());
        let fanout = FanoutDeleter::new(deleter.clone(), metrics.clone());
        Self {
            poller,
            deleter,
            fanout,
            metrics,
        }
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    pub fn deleter(&self) -> &DeleteConvergence {
        &self.deleter
    }

    pub fn metrics(&self) -> &Arc<ConvergenceMetrics> {
        &self.metrics
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// See [`StatusPoller::await_status`]
    pub async fn await_status<T, F, Fut>(
        &self,
        target: &ResourceRef,
        accept: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Option<T>>
    where
        T: Observed + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.poller
            .await_status(target, accept, timeout, cancel, fetch)
            .await
    }

    /// Wait until a resource served by `backend` reaches one of `accept`
    pub async fn wait_for_resource(
        &self,
        backend: &dyn ResourceBackend,
        id: &str,
        accept: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ManagedResource> {
        let target = ResourceRef::new(backend.kind(), id);
        info!(resource = %target, accept = ?accept, "waiting for resource status");
        self.poller
            .await_status(&target, accept, timeout, cancel, || backend.get(id))
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: target.kind,
                id: id.to_string(),
            })
    }

    // =========================================================================
    // Deleting
    // =========================================================================

    /// See [`DeleteConvergence::ensure_deleted`]
    pub async fn ensure_deleted(
        &self,
        target: &dyn DeleteTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.deleter.ensure_deleted(target, timeout, cancel).await
    }

    /// Remove one resource according to `mode`
    pub async fn delete_resource(
        &self,
        backend: Arc<dyn ResourceBackend>,
        id: &str,
        mode: DeleteMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.deleter.remove(backend, id, mode, timeout, cancel).await
    }

    /// See [`FanoutDeleter::cascade_delete`]
    pub async fn cascade_delete(
        &self,
        parent: Option<&ResourceRef>,
        children: Vec<Arc<dyn DeleteTarget>>,
        per_child_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.fanout
            .cascade_delete(parent, children, per_child_timeout, cancel)
            .await
    }

    /// Discover the dependents of `parent` through `dependents` and delete them all
    pub async fn cascade_delete_dependents(
        &self,
        dependents: Arc<dyn ResourceBackend>,
        parent: &ResourceRef,
        per_child_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let children: Vec<Arc<dyn DeleteTarget>> = dependents
            .list_by_parent(&parent.id)
            .await?
            .into_iter()
            .map(|child| {
                Arc::new(BackendTarget::new(dependents.clone(), child.id)) as Arc<dyn DeleteTarget>
            })
            .collect();
        self.cascade_delete(Some(parent), children, per_child_timeout, cancel)
            .await
    }

    /// Delete every replica of `parent` except the first available active one.
    ///
    /// Without such a replica every replica is deleted.
    pub async fn delete_inactive_replicas(
        &self,
        replicas: Arc<dyn ReplicaBackend>,
        parent: &ResourceRef,
        per_child_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let listed = replicas.list_replicas(&parent.id).await?;
        let keep = listed.iter().find(|r| is_active(r)).map(|r| r.id.clone());
        let children: Vec<Arc<dyn DeleteTarget>> = listed
            .into_iter()
            .filter(|replica| keep.as_deref() != Some(replica.id.as_str()))
            .map(|replica| {
                Arc::new(ReplicaTarget::new(replicas.clone(), replica.id)) as Arc<dyn DeleteTarget>
            })
            .collect();
        self.cascade_delete(Some(parent), children, per_child_timeout, cancel)
            .await
    }

    // =========================================================================
    // Migrating
    // =========================================================================

    /// Build a migrator sharing this engine's poller and delete policy
    pub fn migrator(
        &self,
        replicas: Arc<dyn ReplicaBackend>,
        parents: Arc<dyn ResourceBackend>,
        mode: DeleteMode,
        timeouts: MigrationTimeouts,
    ) -> AzMigrator {
        AzMigrator::new(
            replicas,
            parents,
            self.poller.clone(),
            self.deleter.clone(),
            self.metrics.clone(),
        )
        .with_mode(mode)
        .with_timeouts(timeouts)
    }

    /// Relocate `resource_id` to `target_az`; see [`AzMigrator::migrate`]
    #[allow(clippy::too_many_arguments)]
    pub async fn migrate_availability_zone(
        &self,
        replicas: Arc<dyn ReplicaBackend>,
        parents: Arc<dyn ResourceBackend>,
        resource_id: &str,
        target_az: &str,
        mode: DeleteMode,
        timeouts: MigrationTimeouts,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        self.migrator(replicas, parents, mode, timeouts)
            .migrate(resource_id, target_az, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::simulator::{SimulatedBackend, SimulatedControlPlane, SimulatorConfig};
    use crate::domain::ports::{ReplicationState, ResourceKind};
    use assert_matches::assert_matches;

    fn engine() -> ConvergenceEngine {
        let config = EngineConfig {
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
        };
        ConvergenceEngine::new(&config, Arc::new(ConvergenceMetrics::new().unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resource() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Volume, "vol-1", "creating", None);
        plane.script_statuses("vol-1", &["creating", "available"]);
        let volumes = SimulatedBackend::new(plane.clone(), ResourceKind::Volume);

        let volume = engine()
            .wait_for_resource(&volumes, "vol-1", &["available", "in-use"], Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(volume.status, "available");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_missing_resource_is_not_found() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        let volumes = SimulatedBackend::new(plane, ResourceKind::Volume);

        let err = engine()
            .wait_for_resource(&volumes, "vol-404", &["available"], Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cascade_delete_dependents_then_parent() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Volume, "clone-1", "available", Some("nova"));
        for id in ["s1", "s2", "s3"] {
            plane.seed_child(ResourceKind::Snapshot, id, "clone-1", "available");
        }
        plane.fail_deletes("s2", 1);
        let volumes: Arc<dyn ResourceBackend> =
            Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Volume));
        let snapshots: Arc<dyn ResourceBackend> =
            Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Snapshot));
        let engine = engine();
        let cancel = CancellationToken::new();
        let parent = ResourceRef::new(ResourceKind::Volume, "clone-1");

        // Parent refuses to go while snapshots remain
        let err = volumes.delete("clone-1").await.unwrap_err();
        assert!(err.is_conflict());

        engine
            .cascade_delete_dependents(snapshots, &parent, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        engine
            .delete_resource(volumes, "clone-1", DeleteMode::Ensure, Duration::from_secs(60), &cancel)
            .await
            .unwrap();

        for id in ["s1", "s2", "s3", "clone-1"] {
            assert!(!plane.exists(id), "{} should be gone", id);
        }
        assert_eq!(engine.metrics().resets(ResourceKind::Snapshot), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_inactive_replicas_keeps_active() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Share, "share-1", "available", Some("az1"));
        plane.seed_replica("share-1", "rep-a", "az1", "available", ReplicationState::Active);
        plane.seed_replica("share-1", "rep-b", "az2", "available", ReplicationState::InSync);
        plane.seed_replica("share-1", "rep-c", "az3", "error", ReplicationState::Other("error".into()));

        engine()
            .delete_inactive_replicas(
                plane.clone(),
                &ResourceRef::new(ResourceKind::Share, "share-1"),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let left = plane.replicas_of("share-1");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "rep-a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_inactive_replicas_drops_unavailable_active() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Share, "share-1", "available", Some("az1"));
        plane.seed_replica("share-1", "rep-stale", "az2", "error", ReplicationState::Active);
        plane.seed_replica("share-1", "rep-a", "az1", "available", ReplicationState::Active);

        engine()
            .delete_inactive_replicas(
                plane.clone(),
                &ResourceRef::new(ResourceKind::Share, "share-1"),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let left = plane.replicas_of("share-1");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "rep-a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_delete_ignores_missing() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        let images: Arc<dyn ResourceBackend> =
            Arc::new(SimulatedBackend::new(plane, ResourceKind::Image));

        engine()
            .delete_resource(images, "img-404", DeleteMode::BestEffort, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_delete_does_not_wait() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Snapshot, "snap-1", "available", None);
        plane.stick_in_deleting("snap-1");
        let snapshots: Arc<dyn ResourceBackend> =
            Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Snapshot));
        let engine = engine();

        engine
            .delete_resource(snapshots.clone(), "snap-1", DeleteMode::BestEffort, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(plane.exists("snap-1"));

        let err = engine
            .delete_resource(snapshots, "snap-1", DeleteMode::Ensure, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Timeout { .. });
    }
}
