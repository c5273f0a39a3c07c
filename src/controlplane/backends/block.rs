//! Block Store
//!
//! Protects volumes through one of four methods: a volume snapshot, a full
//! volume clone, a backup or an image upload. Every call blocks until the
//! remote resources settle.

use super::{
    merge_metadata, origin_of, readiness, resource_name, BlockBackends, BACKUP_STATUSES, IMAGE_STATUSES,
    SNAPSHOT_STATUSES, VOLUME_STATUSES,
};
use crate::config::{BlockMethod, BlockStoreConfig};
use crate::convergence::{ConvergenceEngine, ConvergenceMetrics, DeleteMode};
use crate::domain::ports::{
    CreateRequest, ManagedResource, ResourceBackend, ResourceKind, ResourceRef, VolumeSnapshotter,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Volume snapshotter for block volumes
pub struct BlockStore {
    config: BlockStoreConfig,
    engine: ConvergenceEngine,
    backends: BlockBackends,
    shutdown: CancellationToken,
}

impl BlockStore {
    pub fn new(
        config: BlockStoreConfig,
        backends: BlockBackends,
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

    pub fn config(&self) -> &BlockStoreConfig {
        &self.config
    }

    /// Create a resource and wait until it reaches one of `accept`
    async fn provision(
        &self,
        request: CreateRequest,
        backend: &dyn ResourceBackend,
        accept: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ManagedResource> {
        let kind = request.kind;
        let name = request.name.clone();
        let created = self.backends.provisioner.create(request).await.map_err(|e| {
            error!(kind = %kind, name = %name, error = %e, "failed to create resource");
            e
        })?;
        info!(resource = %created.resource_ref(), name = %name, "resource created, waiting for it to settle");

        self.engine
            .wait_for_resource(backend, &created.id, accept, timeout, cancel)
            .await
            .map_err(|e| {
                error!(resource = %created.resource_ref(), error = %e, "resource did not settle within the time limit");
                e
            })
    }

    // =========================================================================
    // Create
    // =========================================================================

    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let volume = self.backends.volumes.get(volume_id).await?;
        let request = CreateRequest::new(ResourceKind::Snapshot, resource_name(volume_id, "snap"))
            .with_description("volume snapshot")
            .with_source(volume.resource_ref())
            .with_metadata(merge_metadata(&volume.metadata, tags));

        let snapshot = self
            .provision(
                request,
                self.backends.snapshots.as_ref(),
                SNAPSHOT_STATUSES,
                self.config.snapshot_timeout,
                cancel,
            )
            .await?;
        info!(volume_id, snapshot_id = %snapshot.id, "snapshot finished successfully");
        Ok(snapshot.id)
    }

    /// Wait for `source_id` to be usable and clone it into a new volume
    async fn clone_volume(
        &self,
        source_id: &str,
        name: String,
        volume_type: Option<String>,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let source = self
            .engine
            .wait_for_resource(
                self.backends.volumes.as_ref(),
                source_id,
                VOLUME_STATUSES,
                self.config.volume_timeout,
                cancel,
            )
            .await?;

        let request = CreateRequest::new(ResourceKind::Volume, name)
            .with_description("volume clone")
            .with_source(source.resource_ref())
            .with_availability_zone(Some(volume_az.to_string()))
            .with_volume_type(volume_type.or_else(|| source.volume_type.clone()))
            .with_metadata(merge_metadata(&source.metadata, tags));

        let clone = self
            .provision(
                request,
                self.backends.volumes.as_ref(),
                VOLUME_STATUSES,
                self.config.clone_timeout,
                cancel,
            )
            .await?;
        info!(source_id, clone_id = %clone.id, "volume clone finished successfully");
        Ok(clone.id)
    }

    async fn create_backup(
        &self,
        volume_id: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let volume = self.backends.volumes.get(volume_id).await?;
        let request = CreateRequest::new(ResourceKind::Backup, resource_name(volume_id, "backup"))
            .with_description("volume backup")
            .with_source(volume.resource_ref())
            .with_metadata(merge_metadata(&volume.metadata, tags));

        let backup = self
            .provision(
                request,
                self.backends.backups.as_ref(),
                BACKUP_STATUSES,
                self.config.backup_timeout,
                cancel,
            )
            .await?;
        info!(volume_id, backup_id = %backup.id, "backup finished successfully");
        Ok(backup.id)
    }

    async fn create_image(
        &self,
        volume_id: &str,
        tags: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let volume = self.backends.volumes.get(volume_id).await?;
        let request = CreateRequest::new(ResourceKind::Image, resource_name(volume_id, "image"))
            .with_description("volume image")
            .with_source(volume.resource_ref())
            .with_metadata(merge_metadata(&volume.metadata, tags));

        let image = self
            .provision(
                request,
                self.backends.images.as_ref(),
                IMAGE_STATUSES,
                self.config.image_timeout,
                cancel,
            )
            .await?;
        info!(volume_id, image_id = %image.id, "image upload finished successfully");
        Ok(image.id)
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Wait for a restore source and create a volume from it
    #[allow(clippy::too_many_arguments)]
    async fn restore_from(
        &self,
        source_backend: &dyn ResourceBackend,
        source_id: &str,
        accept: &[&str],
        source_timeout: Duration,
        volume_type: &str,
        volume_az: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let source = self
            .engine
            .wait_for_resource(source_backend, source_id, accept, source_timeout, cancel)
            .await?;

        let request = CreateRequest::new(ResourceKind::Volume, resource_name(source_id, "backup"))
            .with_description("volume restored from backup")
            .with_source(source.resource_ref())
            .with_availability_zone(Some(volume_az.to_string()))
            .with_volume_type(Some(volume_type.to_string()))
            .with_metadata(self.restore_metadata(&source).await?);

        let volume = self
            .provision(
                request,
                self.backends.volumes.as_ref(),
                VOLUME_STATUSES,
                self.config.volume_timeout,
                cancel,
            )
            .await?;
        info!(source = %source.resource_ref(), volume_id = %volume.id, "volume restored");
        Ok(volume.id)
    }

    /// Metadata a restored volume starts with: a snapshot's origin volume,
    /// a backup's own, nothing for an image.
    async fn restore_metadata(&self, source: &ManagedResource) -> Result<BTreeMap<String, String>> {
        match source.kind {
            ResourceKind::Snapshot => {
                let origin = origin_of(self.backends.volumes.as_ref(), source).await?;
                Ok(origin.metadata)
            }
            ResourceKind::Image => Ok(BTreeMap::new()),
            _ => Ok(source.metadata.clone()),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    async fn delete_clone(&self, clone_id: &str, cancel: &CancellationToken) -> Result<()> {
        if self.config.cascade_delete {
            let clone = ResourceRef::new(ResourceKind::Volume, clone_id);
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
                self.backends.volumes.clone(),
                clone_id,
                self.config.delete_mode(),
                self.config.clone_timeout,
                cancel,
            )
            .await
    }
}

#[async_trait]
impl VolumeSnapshotter for BlockStore {
    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        info!(volume_id, volume_az, method = %self.config.method, "BlockStore.create_snapshot called");
        let cancel = self.shutdown.child_token();

        match self.config.method {
            BlockMethod::Snapshot => self.create_volume_snapshot(volume_id, tags, &cancel).await,
            BlockMethod::Clone => {
                let name = resource_name(volume_id, "clone");
                self.clone_volume(volume_id, name, None, volume_az, tags, &cancel)
                    .await
            }
            BlockMethod::Backup => self.create_backup(volume_id, tags, &cancel).await,
            BlockMethod::Image => self.create_image(volume_id, tags, &cancel).await,
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot_id, method = %self.config.method, "BlockStore.delete_snapshot called");
        let cancel = self.shutdown.child_token();
        let mode = self.config.delete_mode();

        match self.config.method {
            BlockMethod::Snapshot => {
                self.engine
                    .delete_resource(
                        self.backends.snapshots.clone(),
                        snapshot_id,
                        mode,
                        self.config.snapshot_timeout,
                        &cancel,
                    )
                    .await
            }
            BlockMethod::Clone => self.delete_clone(snapshot_id, &cancel).await,
            BlockMethod::Backup => {
                self.engine
                    .delete_resource(
                        self.backends.backups.clone(),
                        snapshot_id,
                        mode,
                        self.config.backup_timeout,
                        &cancel,
                    )
                    .await
            }
            // Images are never reset, a single delete call is enough
            BlockMethod::Image => {
                self.engine
                    .delete_resource(
                        self.backends.images.clone(),
                        snapshot_id,
                        DeleteMode::BestEffort,
                        self.config.image_timeout,
                        &cancel,
                    )
                    .await
            }
        }
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_az: &str,
    ) -> Result<String> {
        info!(snapshot_id, volume_type, volume_az, method = %self.config.method, "BlockStore.create_volume_from_snapshot called");
        let cancel = self.shutdown.child_token();

        match self.config.method {
            BlockMethod::Snapshot => {
                self.restore_from(
                    self.backends.snapshots.as_ref(),
                    snapshot_id,
                    SNAPSHOT_STATUSES,
                    self.config.snapshot_timeout,
                    volume_type,
                    volume_az,
                    &cancel,
                )
                .await
            }
            BlockMethod::Clone => {
                let name = resource_name(snapshot_id, "backup");
                let volume_type = Some(volume_type.to_string()).filter(|t| !t.is_empty());
                self.clone_volume(snapshot_id, name, volume_type, volume_az, &BTreeMap::new(), &cancel)
                    .await
            }
            BlockMethod::Backup => {
                self.restore_from(
                    self.backends.backups.as_ref(),
                    snapshot_id,
                    BACKUP_STATUSES,
                    self.config.backup_timeout,
                    volume_type,
                    volume_az,
                    &cancel,
                )
                .await
            }
            BlockMethod::Image => {
                self.restore_from(
                    self.backends.images.as_ref(),
                    snapshot_id,
                    IMAGE_STATUSES,
                    self.config.image_timeout,
                    volume_type,
                    volume_az,
                    &cancel,
                )
                .await
            }
        }
    }

    async fn is_volume_ready(&self, volume_id: &str, volume_az: &str) -> Result<bool> {
        info!(volume_id, volume_az, "BlockStore.is_volume_ready called");
        let volume = self.backends.volumes.get(volume_id).await?;
        readiness(&volume, VOLUME_STATUSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::simulator::{SimOperation, SimulatedControlPlane, SimulatorConfig};
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn config(method: BlockMethod) -> BlockStoreConfig {
        BlockStoreConfig {
            method,
            volume_timeout: Duration::from_secs(60),
            snapshot_timeout: Duration::from_secs(60),
            clone_timeout: Duration::from_secs(60),
            backup_timeout: Duration::from_secs(60),
            image_timeout: Duration::from_secs(60),
            ensure_deleted_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn store(plane: &Arc<SimulatedControlPlane>, config: BlockStoreConfig) -> BlockStore {
        BlockStore::new(
            config,
            BlockBackends::simulated(plane.clone()),
            Arc::new(ConvergenceMetrics::new().unwrap()),
            CancellationToken::new(),
        )
    }

    fn seeded_plane() -> Arc<SimulatedControlPlane> {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        plane.seed(ResourceKind::Volume, "vol-1", "in-use", Some("az1"));
        plane
    }

    fn tags() -> BTreeMap<String, String> {
        BTreeMap::from([("backup".to_string(), "nightly".to_string())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_method_round() {
        let plane = seeded_plane();
        let store = store(&plane, config(BlockMethod::Snapshot));

        let snapshot_id = store.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        let snapshot = plane.resource(&snapshot_id).unwrap();
        assert_eq!(snapshot.kind, ResourceKind::Snapshot);
        assert_eq!(snapshot.status, "available");
        assert_eq!(snapshot.metadata["backup"], "nightly");
        assert!(snapshot.name.starts_with("vol-1.snap."));

        let volume_id = store
            .create_volume_from_snapshot(&snapshot_id, "ssd", "az2")
            .await
            .unwrap();
        let volume = plane.resource(&volume_id).unwrap();
        assert_eq!(volume.status, "available");
        assert_eq!(volume.availability_zone.as_deref(), Some("az2"));
        assert_eq!(volume.volume_type.as_deref(), Some("ssd"));

        store.delete_snapshot(&snapshot_id).await.unwrap();
        assert_eq!(plane.call_count(SimOperation::Delete), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_method_places_clone_in_requested_zone() {
        let plane = seeded_plane();
        let store = store(&plane, config(BlockMethod::Clone));

        let clone_id = store.create_snapshot("vol-1", "az3", &tags()).await.unwrap();
        let clone = plane.resource(&clone_id).unwrap();
        assert_eq!(clone.kind, ResourceKind::Volume);
        assert_eq!(clone.availability_zone.as_deref(), Some("az3"));
        assert!(clone.name.starts_with("vol-1.clone."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_and_image_methods() {
        let plane = seeded_plane();

        let backups = store(&plane, config(BlockMethod::Backup));
        let backup_id = backups.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        assert_eq!(plane.resource(&backup_id).unwrap().kind, ResourceKind::Backup);
        let restored = backups
            .create_volume_from_snapshot(&backup_id, "", "az1")
            .await
            .unwrap();
        assert_eq!(plane.resource(&restored).unwrap().status, "available");

        let images = store(&plane, config(BlockMethod::Image));
        let image_id = images.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        let image = plane.resource(&image_id).unwrap();
        assert_eq!(image.kind, ResourceKind::Image);
        assert_eq!(image.status, "active");
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_delete_is_best_effort() {
        let plane = seeded_plane();
        let mut config = config(BlockMethod::Image);
        config.ensure_deleted = true;
        let store = store(&plane, config);

        store.delete_snapshot("img-404").await.unwrap();
        assert_eq!(plane.call_count(SimOperation::Get), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_delete_cascades_to_snapshots() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Volume, "clone-1", "available", Some("az1"));
        for id in ["s1", "s2"] {
            plane.seed_child(ResourceKind::Snapshot, id, "clone-1", "available");
        }
        plane.fail_deletes("s2", 1);
        let mut config = config(BlockMethod::Clone);
        config.ensure_deleted = true;
        config.cascade_delete = true;
        let store = store(&plane, config);

        store.delete_snapshot("clone-1").await.unwrap();

        for id in ["s1", "s2", "clone-1"] {
            assert!(!plane.exists(id), "{} should be gone", id);
        }
        assert!(plane.exists("vol-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_delete_without_cascade_conflicts() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Volume, "clone-1", "available", Some("az1"));
        plane.seed_child(ResourceKind::Snapshot, "s1", "clone-1", "available");
        let store = store(&plane, config(BlockMethod::Clone));

        let err = store.delete_snapshot("clone-1").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(plane.exists("clone-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_volume_ready() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Volume, "vol-2", "creating", Some("az1"));
        plane.seed(ResourceKind::Volume, "vol-3", "error", Some("az1"));
        let store = store(&plane, config(BlockMethod::Snapshot));

        assert!(store.is_volume_ready("vol-1", "az1").await.unwrap());
        assert!(!store.is_volume_ready("vol-2", "az1").await.unwrap());
        assert_matches!(
            store.is_volume_ready("vol-3", "az1").await,
            Err(Error::ErrorState { .. })
        );
        assert!(store
            .is_volume_ready("vol-404", "az1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_errored_snapshot_fails() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Snapshot, "snap-1", "error", Some("az1"));
        let store = store(&plane, config(BlockMethod::Snapshot));

        let err = store
            .create_volume_from_snapshot("snap-1", "ssd", "az1")
            .await
            .unwrap_err();
        assert_matches!(err, Error::ErrorState { status, .. } if status == "error");
        assert_eq!(plane.call_count(SimOperation::Create), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waits() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Snapshot, "snap-1", "creating", Some("az1"));
        let shutdown = CancellationToken::new();
        let store = BlockStore::new(
            config(BlockMethod::Snapshot),
            BlockBackends::simulated(plane.clone()),
            Arc::new(ConvergenceMetrics::new().unwrap()),
            shutdown.clone(),
        );

        let restore = tokio::spawn(async move {
            store.create_volume_from_snapshot("snap-1", "ssd", "az1").await
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();

        let err = restore.await.unwrap().unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_takes_origin_volume_metadata() {
        let plane = seeded_plane();
        plane.tag("vol-1", "team", "storage");
        let store = store(&plane, config(BlockMethod::Snapshot));

        let snapshot_id = store.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        plane.tag("vol-1", "tier", "gold");
        let volume_id = store
            .create_volume_from_snapshot(&snapshot_id, "ssd", "az1")
            .await
            .unwrap();

        let volume = plane.resource(&volume_id).unwrap();
        assert_eq!(volume.metadata["team"], "storage");
        assert_eq!(volume.metadata["tier"], "gold");
        assert!(!volume.metadata.contains_key("backup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_metadata_by_source_kind() {
        let plane = seeded_plane();
        plane.tag("vol-1", "team", "storage");

        let backups = store(&plane, config(BlockMethod::Backup));
        let backup_id = backups.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        let restored = backups
            .create_volume_from_snapshot(&backup_id, "", "az1")
            .await
            .unwrap();
        let restored = plane.resource(&restored).unwrap();
        assert_eq!(restored.metadata["backup"], "nightly");
        assert_eq!(restored.metadata["team"], "storage");

        let images = store(&plane, config(BlockMethod::Image));
        let image_id = images.create_snapshot("vol-1", "az1", &tags()).await.unwrap();
        let restored = images
            .create_volume_from_snapshot(&image_id, "", "az1")
            .await
            .unwrap();
        assert!(plane.resource(&restored).unwrap().metadata.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_without_origin_is_not_restored() {
        let plane = seeded_plane();
        plane.seed(ResourceKind::Snapshot, "snap-1", "available", Some("az1"));
        let store = store(&plane, config(BlockMethod::Snapshot));

        let err = store
            .create_volume_from_snapshot("snap-1", "ssd", "az1")
            .await
            .unwrap_err();

        assert_matches!(err, Error::MissingOrigin { ref resource } if resource.id == "snap-1");
        assert_eq!(err.action(), crate::error::ErrorAction::NoRetry);
        assert_eq!(plane.call_count(SimOperation::Create), 0);
    }
}
