//! File Store
//!
//! Protects shares either with a share snapshot or with a full share clone
//! made through an intermediate snapshot. Clones that land outside the
//! requested availability zone can be moved there through a replica.

use super::{
    merge_metadata, origin_of, readiness, resource_name, FileBackends, SHARE_STATUSES,
    SNAPSHOT_STATUSES,
};
use crate::config::{FileMethod, FileStoreConfig};
use crate::convergence::{ConvergenceEngine, ConvergenceMetrics};
use crate::domain::ports::{
    CreateRequest, ManagedResource, ResourceKind, ResourceRef, VolumeSnapshotter,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Volume snapshotter for shared file systems
pub struct FileStore {
    config: FileStoreConfig,
    engine: ConvergenceEngine,
    backends: FileBackends,
    shutdown: CancellationToken,
}

impl FileStore {
    pub fn new(
        config: FileStoreConfig,
        backends: FileBackends,
        metrics: Arc<ConvergenceMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let engine = ConvergenceEngine::new(&config.engine(), metrics);
        Self {
            config,
            engine,
            backends,
            shutdown,
        }
    }

    pub fn config(&self) -> &FileStoreConfig {
        &self.config
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Zone to request for a share derived from a resource in `origin_az`.
    ///
    /// A share created from a snapshot cannot be placed in another zone, so
    /// with `enforce_az` the zone is left to the control plane and the share
    /// is migrated afterwards.
    fn requested_zone(&self, origin_az: Option<&str>, volume_az: &str) -> Option<String> {
        if self.config.enforce_az && !volume_az.is_empty() && origin_az != Some(volume_az) {
            return None;
        }
        Some(volume_az.to_string())
    }

    async fn enforce_zone(
        &self,
        share: &ManagedResource,
        volume_az: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.config.enforce_az
            || volume_az.is_empty()
            || share.availability_zone.as_deref() == Some(volume_az)
        {
            return Ok(());
        }

        info!(share_id = %share.id, from = ?share.availability_zone, to = volume_az, "moving share to the target availability zone");
        let report = self
            .engine
            .migrate_availability_zone(
                self.backends.replicas.clone(),
                self.backends.shares.clone(),
                &share.id,
                volume_az,
                self.config.delete_mode(),
                self.config.migration_timeouts(),
                cancel,
            )
            .await
            .map_err(|e| {
                error!(share_id = %share.id, volume_az, error = %e, "failed to move share to the target availability zone");
                e
            })?;
        info!(share_id = %share.id, outcome = ?report.outcome, "share moved");
        Ok(())
    }

    // =========================================================================
    // Create
    // =========================================================================

    async fn create_share_snapshot(
        &self,
        share_id: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = CreateRequest::new(ResourceKind::ShareSnapshot, resource_name(share_id, "snap"))
            .with_description("share snapshot")
            .with_source(ResourceRef::new(ResourceKind::Share, share_id))
            .with_metadata(tags.clone());
        let snapshot = self.backends.provisioner.create(request).await.map_err(|e| {
            error!(share_id, error = %e, "failed to create snapshot from share");
            e
        })?;

        self.engine
            .wait_for_resource(
                self.backends.snapshots.as_ref(),
                &snapshot.id,
                SNAPSHOT_STATUSES,
                self.config.snapshot_timeout,
                cancel,
            )
            .await?;
        info!(share_id, snapshot_id = %snapshot.id, "snapshot finished successfully");
        Ok(snapshot.id)
    }

    /// Clone `share_id` through an intermediate snapshot.
    ///
    /// The intermediate snapshot is removed whatever the outcome.
    async fn clone_share(
        &self,
        share_id: &str,
        name: String,
        description: &str,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let origin = self
            .engine
            .wait_for_resource(
                self.backends.shares.as_ref(),
                share_id,
                SHARE_STATUSES,
                self.config.share_timeout,
                cancel,
            )
            .await?;

        let request = CreateRequest::new(ResourceKind::ShareSnapshot, name.clone())
            .with_description("intermediate snapshot")
            .with_source(origin.resource_ref());
        let snapshot = self.backends.provisioner.create(request).await.map_err(|e| {
            error!(share_id, error = %e, "failed to create an intermediate snapshot");
            e
        })?;

        let cloned = self
            .clone_from_snapshot(&origin, &snapshot.id, name, description, volume_az, tags, cancel)
            .await;

        info!(snapshot_id = %snapshot.id, "removing the intermediate snapshot");
        if let Err(e) = self
            .engine
            .delete_resource(
                self.backends.snapshots.clone(),
                &snapshot.id,
                self.config.delete_mode(),
                self.config.snapshot_timeout,
                cancel,
            )
            .await
        {
            warn!(snapshot_id = %snapshot.id, error = %e, "failed to delete intermediate snapshot");
        }

        cloned
    }

    #[allow(clippy::too_many_arguments)]
    async fn clone_from_snapshot(
        &self,
        origin: &ManagedResource,
        snapshot_id: &str,
        name: String,
        description: &str,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.engine
            .wait_for_resource(
                self.backends.snapshots.as_ref(),
                snapshot_id,
                SNAPSHOT_STATUSES,
                self.config.snapshot_timeout,
                cancel,
            )
            .await?;

        let request = CreateRequest::new(ResourceKind::Share, name)
            .with_description(description)
            .with_source(ResourceRef::new(ResourceKind::ShareSnapshot, snapshot_id))
            .with_availability_zone(
                self.requested_zone(origin.availability_zone.as_deref(), volume_az),
            )
            .with_volume_type(origin.volume_type.clone())
            .with_metadata(merge_metadata(&origin.metadata, tags));
        let share = self.backends.provisioner.create(request).await.map_err(|e| {
            error!(snapshot_id, error = %e, "failed to create share clone from intermediate snapshot");
            e
        })?;

        let clone = self
            .engine
            .wait_for_resource(
                self.backends.shares.as_ref(),
                &share.id,
                SHARE_STATUSES,
                self.config.clone_timeout,
                cancel,
            )
            .await?;

        self.enforce_zone(&clone, volume_az, cancel).await?;
        info!(source_id = %origin.id, clone_id = %clone.id, "share clone finished successfully");
        Ok(clone.id)
    }

    // =========================================================================
    // Restore
    // =========================================================================

    async fn restore_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_az: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let snapshot = self
            .engine
            .wait_for_resource(
                self.backends.snapshots.as_ref(),
                snapshot_id,
                SNAPSHOT_STATUSES,
                self.config.snapshot_timeout,
                cancel,
            )
            .await?;
        let origin = origin_of(self.backends.shares.as_ref(), &snapshot).await?;

        let request = CreateRequest::new(ResourceKind::Share, resource_name(snapshot_id, "backup"))
            .with_description("share restored from snapshot")
            .with_source(snapshot.resource_ref())
            .with_availability_zone(
                self.requested_zone(origin.availability_zone.as_deref(), volume_az),
            )
            .with_volume_type(Some(volume_type.to_string()))
            .with_metadata(origin.metadata);
        let created = self.backends.provisioner.create(request).await?;

        let share = self
            .engine
            .wait_for_resource(
                self.backends.shares.as_ref(),
                &created.id,
                SHARE_STATUSES,
                self.config.share_timeout,
                cancel,
            )
            .await?;

        self.enforce_zone(&share, volume_az, cancel).await?;
        info!(snapshot_id, share_id = %share.id, "share restored");
        Ok(share.id)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    async fn delete_clone(&self, clone_id: &str, cancel: &CancellationToken) -> Result<()> {
        if self.config.cascade_delete {
            let clone = ResourceRef::new(ResourceKind::Share, clone_id);
            self.engine
                .delete_inactive_replicas(
                    self.backends.replicas.clone(),
                    &clone,
                    self.config.replica_timeout,
                    cancel,
                )
                .await?;
            self.engine
                .cascade_delete_dependents(
                    self.backends.snapshots.clone(),
                    &clone,
                    self.config.snapshot_timeout,
                    cancel,
                )
                .await?;
        }

        self.engine
            .delete_resource(
                self.backends.shares.clone(),
                clone_id,
                self.config.delete_mode(),
                self.config.clone_timeout,
                cancel,
            )
            .await
    }
}

#[async_trait]
impl VolumeSnapshotter for FileStore {
    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        info!(volume_id, volume_az, method = %self.config.method, "FileStore.create_snapshot called");
        let cancel = self.shutdown.child_token();

        match self.config.method {
            FileMethod::Snapshot => self.create_share_snapshot(volume_id, tags, &cancel).await,
            FileMethod::Clone => {
                let name = resource_name(volume_id, "clone");
                self.clone_share(volume_id, name, "share clone", volume_az, tags, &cancel)
                    .await
            }
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot_id, method = %self.config.method, "FileStore.delete_snapshot called");
        let cancel = self.shutdown.child_token();

        match self.config.method {
            FileMethod::Snapshot => {
                self.engine
                    .delete_resource(
                        self.backends.snapshots.clone(),
                        snapshot_id,
                        self.config.delete_mode(),
                        self.config.snapshot_timeout,
                        &cancel,
                    )
                    .await
            }
            FileMethod::Clone => self.delete_clone(snapshot_id, &cancel).await,
        }
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_az: &str,
    ) -> Result<String> {
        info!(snapshot_id, volume_type, volume_az, method = %self.config.method, "FileStore.create_volume_from_snapshot called");
        let cancel = self.shutdown.child_token();

        match self.config.method {
            FileMethod::Snapshot => {
                self.restore_from_snapshot(snapshot_id, volume_type, volume_az, &cancel)
                    .await
            }
            FileMethod::Clone => {
                let name = resource_name(snapshot_id, "backup");
                self.clone_share(
                    snapshot_id,
                    name,
                    "share restored from clone",
                    volume_az,
                    &BTreeMap::new(),
                    &cancel,
                )
                .await
            }
        }
    }

    async fn is_volume_ready(&self, volume_id: &str, volume_az: &str) -> Result<bool> {
        info!(volume_id, volume_az, "FileStore.is_volume_ready called");
        let share = self.backends.shares.get(volume_id).await?;
        readiness(&share, SHARE_STATUSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::simulator::{SimOperation, SimulatedControlPlane, SimulatorConfig};
    use crate::convergence::MigrationStep;
    use crate::domain::ports::{ReplicationState, ResourceKind};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn config(method: FileMethod) -> FileStoreConfig {
        FileStoreConfig {
            method,
            share_timeout: Duration::from_secs(60),
            snapshot_timeout: Duration::from_secs(60),
            clone_timeout: Duration::from_secs(60),
            replica_timeout: Duration::from_secs(60),
            ensure_deleted_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn store(plane: &Arc<SimulatedControlPlane>, config: FileStoreConfig) -> FileStore {
        FileStore::new(
            config,
            FileBackends::simulated(plane.clone()),
            Arc::new(ConvergenceMetrics::new().unwrap()),
            CancellationToken::new(),
        )
    }

    fn seeded_plane() -> Arc<SimulatedControlPlane> {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Share, "share-1", "available", Some("az1"));
        plane.seed_replica("share-1", "rep-1", "az1", "available", ReplicationState::Active);
        plane
    }

    fn tags() -> BTreeMap<String, String> {
        BTreeMap::from([("backup".to_string(), "nightly".to_string())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_method_round() {
        let plane = seeded_plane();
        plane.tag("share-1", "team", "storage");
        let store = store(&plane, config(FileMethod::Snapshot));

        let snapshot_id = store.create_snapshot("share-1", "az1", &tags()).await.unwrap();
        let snapshot = plane.resource(&snapshot_id).unwrap();
        assert_eq!(snapshot.kind, ResourceKind::ShareSnapshot);
        assert_eq!(snapshot.status, "available");
        assert_eq!(snapshot.metadata["backup"], "nightly");

        let share_id = store
            .create_volume_from_snapshot(&snapshot_id, "nfs", "az1")
            .await
            .unwrap();
        let share = plane.resource(&share_id).unwrap();
        assert_eq!(share.kind, ResourceKind::Share);
        assert_eq!(share.availability_zone.as_deref(), Some("az1"));
        assert_eq!(share.metadata["team"], "storage");
        assert!(!share.metadata.contains_key("backup"));

        store.delete_snapshot(&snapshot_id).await.unwrap();
        assert_eq!(plane.call_count(SimOperation::Delete), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_removes_intermediate_snapshot() {
        let plane = seeded_plane();
        let mut config = config(FileMethod::Clone);
        config.ensure_deleted = true;
        let store = store(&plane, config);

        let clone_id = store.create_snapshot("share-1", "az1", &tags()).await.unwrap();

        let clone = plane.resource(&clone_id).unwrap();
        assert_eq!(clone.status, "available");
        assert_eq!(clone.metadata["backup"], "nightly");
        assert!(clone.name.starts_with("share-1.clone."));
        assert!(plane.resources_of_kind(ResourceKind::ShareSnapshot).is_empty());
        assert_eq!(plane.call_count(SimOperation::CreateReplica), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_placed_directly_without_enforced_zone() {
        let plane = seeded_plane();
        let store = store(&plane, config(FileMethod::Clone));

        let clone_id = store.create_snapshot("share-1", "az2", &tags()).await.unwrap();

        let clone = plane.resource(&clone_id).unwrap();
        assert_eq!(clone.availability_zone.as_deref(), Some("az2"));
        assert_eq!(plane.call_count(SimOperation::CreateReplica), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforced_zone_migrates_the_clone() {
        let plane = seeded_plane();
        let mut config = config(FileMethod::Clone);
        config.enforce_az = true;
        config.ensure_deleted = true;
        let store = store(&plane, config);

        let clone_id = store.create_snapshot("share-1", "az2", &tags()).await.unwrap();

        let clone = plane.resource(&clone_id).unwrap();
        assert_eq!(clone.availability_zone.as_deref(), Some("az2"));
        assert_eq!(plane.calls(SimOperation::CreateReplica), vec![clone_id.clone()]);
        assert_eq!(
            plane.resource("share-1").unwrap().availability_zone.as_deref(),
            Some("az1")
        );
        assert!(plane.resources_of_kind(ResourceKind::ShareSnapshot).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_into_other_zone_follows_origin_share() {
        let plane = seeded_plane();
        plane.tag("share-1", "team", "storage");
        let mut config = config(FileMethod::Snapshot);
        config.enforce_az = true;
        config.ensure_deleted = true;
        let store = store(&plane, config);

        let snapshot_id = store.create_snapshot("share-1", "az1", &tags()).await.unwrap();
        let share_id = store
            .create_volume_from_snapshot(&snapshot_id, "nfs", "az2")
            .await
            .unwrap();

        let share = plane.resource(&share_id).unwrap();
        assert_eq!(share.availability_zone.as_deref(), Some("az2"));
        assert_eq!(share.metadata["team"], "storage");
        assert_eq!(plane.calls(SimOperation::CreateReplica), vec![share_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_requires_origin_share() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::ShareSnapshot, "snap-x", "available", Some("az1"));
        let store = store(&plane, config(FileMethod::Snapshot));

        let err = store
            .create_volume_from_snapshot("snap-x", "nfs", "az1")
            .await
            .unwrap_err();

        assert_matches!(err, Error::MissingOrigin { resource } if resource.id == "snap-x");
        assert_eq!(plane.call_count(SimOperation::Create), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_migration_still_cleans_up() {
        let plane = seeded_plane();
        plane.fail_next(SimOperation::Promote, "promotion refused");
        let mut config = config(FileMethod::Clone);
        config.enforce_az = true;
        config.ensure_deleted = true;
        let store = store(&plane, config);

        let err = store.create_snapshot("share-1", "az2", &tags()).await.unwrap_err();

        assert_eq!(err.migration_step(), Some(MigrationStep::Promote));
        assert!(plane.resources_of_kind(ResourceKind::ShareSnapshot).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_delete_cascades() {
        let plane = seeded_plane();
        let mut config = config(FileMethod::Clone);
        config.ensure_deleted = true;
        config.cascade_delete = true;
        let store = store(&plane, config);

        let clone_id = store.create_snapshot("share-1", "az1", &tags()).await.unwrap();
        plane.seed_replica(&clone_id, "rep-x", "az3", "available", ReplicationState::InSync);
        plane.seed_child(ResourceKind::ShareSnapshot, "snap-x", &clone_id, "available");
        plane.fail_deletes("snap-x", 1);

        store.delete_snapshot(&clone_id).await.unwrap();

        for id in [clone_id.as_str(), "rep-x", "snap-x"] {
            assert!(!plane.exists(id), "{} should be gone", id);
        }
        assert!(plane.exists("share-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_delete_without_cascade_conflicts() {
        let plane = seeded_plane();
        let store = store(&plane, config(FileMethod::Clone));

        let clone_id = store.create_snapshot("share-1", "az1", &tags()).await.unwrap();
        plane.seed_child(ResourceKind::ShareSnapshot, "snap-x", &clone_id, "available");

        let err = store.delete_snapshot(&clone_id).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_volume_ready() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Share, "share-2", "creating", Some("az1"));
        plane.seed(ResourceKind::Share, "share-3", "error", Some("az1"));
        let store = store(&plane, config(FileMethod::Snapshot));

        assert!(store.is_volume_ready("share-1", "az1").await.unwrap());
        assert!(!store.is_volume_ready("share-2", "az1").await.unwrap());
        assert_matches!(
            store.is_volume_ready("share-3", "az1").await,
            Err(Error::ErrorState { .. })
        );
    }
}
