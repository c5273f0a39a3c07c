//! Backend Stores
//!
//! Volume snapshotter implementations built on the convergence engine:
//! - Block: volumes, snapshots, backups and images
//! - File: shares, share snapshots and share replicas

pub mod block;
pub mod file;

pub use block::*;
pub use file::*;

use crate::config::PluginConfig;
use crate::controlplane::simulator::{SimulatedBackend, SimulatedControlPlane};
use crate::convergence::classify::{classify_status, StatusClass};
use crate::convergence::ConvergenceMetrics;
use crate::domain::ports::{
    ManagedResource, ProvisionerRef, ReplicaBackendRef, ResourceBackend, ResourceBackendRef,
    ResourceKind, VolumeSnapshotter,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Accepted Statuses
// =============================================================================

pub const VOLUME_STATUSES: &[&str] = &["available", "in-use"];
pub const SNAPSHOT_STATUSES: &[&str] = &["available"];
pub const BACKUP_STATUSES: &[&str] = &["available"];
pub const IMAGE_STATUSES: &[&str] = &["active"];
pub const SHARE_STATUSES: &[&str] = &["available"];

// =============================================================================
// Helpers
// =============================================================================

/// Name of a resource derived from `source`, e.g. `vol-1.snap.<uuid>`
pub fn resource_name(source: &str, suffix: &str) -> String {
    format!("{}.{}.{}", source, suffix, Uuid::new_v4().simple())
}

/// Overlay `tags` on top of `base`
pub fn merge_metadata(
    base: &BTreeMap<String, String>,
    tags: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Readiness of a resource against its usable statuses
pub(crate) fn readiness(resource: &ManagedResource, accept: &[&str]) -> Result<bool> {
    match classify_status(&resource.status, accept) {
        StatusClass::Accepted => Ok(true),
        StatusClass::ErrorState => Err(Error::ErrorState {
            resource: resource.resource_ref(),
            status: resource.status.clone(),
        }),
        StatusClass::Transient => Ok(false),
    }
}

/// Fetch the resource `derived` was taken from through `backend`
pub(crate) async fn origin_of(
    backend: &dyn ResourceBackend,
    derived: &ManagedResource,
) -> Result<ManagedResource> {
    let origin_id = derived
        .source_id
        .as_deref()
        .ok_or_else(|| Error::MissingOrigin {
            resource: derived.resource_ref(),
        })?;
    backend.get(origin_id).await
}

// =============================================================================
// Backend Bundles
// =============================================================================

/// Ports used by the block store
#[derive(Clone)]
pub struct BlockBackends {
    pub volumes: ResourceBackendRef,
    pub snapshots: ResourceBackendRef,
    pub backups: ResourceBackendRef,
    pub images: ResourceBackendRef,
    pub provisioner: ProvisionerRef,
}

impl BlockBackends {
    /// Serve every port from the in-memory control plane
    pub fn simulated(plane: Arc<SimulatedControlPlane>) -> Self {
        Self {
            volumes: Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Volume)),
            snapshots: Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Snapshot)),
            backups: Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Backup)),
            images: Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Image)),
            provisioner: plane,
        }
    }
}

/// Ports used by the file store
#[derive(Clone)]
pub struct FileBackends {
    pub shares: ResourceBackendRef,
    pub snapshots: ResourceBackendRef,
    pub replicas: ReplicaBackendRef,
    pub provisioner: ProvisionerRef,
}

impl FileBackends {
    pub fn simulated(plane: Arc<SimulatedControlPlane>) -> Self {
        Self {
            shares: Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Share)),
            snapshots: Arc::new(SimulatedBackend::new(
                plane.clone(),
                ResourceKind::ShareSnapshot,
            )),
            replicas: plane.clone(),
            provisioner: plane,
        }
    }
}

// =============================================================================
// Store Factory
// =============================================================================

/// Factory for creating volume snapshotters
pub struct StoreFactory;

impl StoreFactory {
    /// Create a store by name against the in-memory control plane
    pub fn simulated(
        name: &str,
        config: &PluginConfig,
        plane: Arc<SimulatedControlPlane>,
        metrics: Arc<ConvergenceMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Arc<dyn VolumeSnapshotter>> {
        match name.to_lowercase().as_str() {
            "block" | "volume" => Ok(Arc::new(BlockStore::new(
                config.block.clone(),
                BlockBackends::simulated(plane),
                metrics,
                shutdown,
            ))),
            "file" | "share" => Ok(Arc::new(FileStore::new(
                config.file.clone(),
                FileBackends::simulated(plane),
                metrics,
                shutdown,
            ))),
            other => Err(Error::Configuration(format!(
                "unknown store {:?}, expected block or file",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::simulator::SimulatorConfig;

    #[test]
    fn test_resource_name() {
        let name = resource_name("vol-1", "snap");
        assert!(name.starts_with("vol-1.snap."));
        assert_eq!(name.len(), "vol-1.snap.".len() + 32);
        assert_ne!(name, resource_name("vol-1", "snap"));
    }

    #[test]
    fn test_merge_metadata_tags_win() {
        let base = BTreeMap::from([
            ("team".to_string(), "storage".to_string()),
            ("tier".to_string(), "hot".to_string()),
        ]);
        let tags = BTreeMap::from([("tier".to_string(), "cold".to_string())]);

        let merged = merge_metadata(&base, &tags);
        assert_eq!(merged["team"], "storage");
        assert_eq!(merged["tier"], "cold");
    }

    #[test]
    fn test_readiness() {
        let mut resource = ManagedResource {
            id: "vol-1".into(),
            kind: ResourceKind::Volume,
            name: "vol-1".into(),
            status: "in-use".into(),
            availability_zone: None,
            volume_type: None,
            metadata: BTreeMap::new(),
            source_id: None,
        };
        assert!(readiness(&resource, VOLUME_STATUSES).unwrap());

        resource.status = "creating".into();
        assert!(!readiness(&resource, VOLUME_STATUSES).unwrap());

        resource.status = "error_restoring".into();
        assert!(readiness(&resource, VOLUME_STATUSES)
            .unwrap_err()
            .is_error_state());
    }

    #[test]
    fn test_factory_rejects_unknown_store() {
        let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));
        let result = StoreFactory::simulated(
            "object",
            &PluginConfig::default(),
            plane,
            Arc::new(ConvergenceMetrics::new().unwrap()),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
