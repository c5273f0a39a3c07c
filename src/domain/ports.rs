//! Domain Ports - Core trait definitions for the convergence engine
//!
//! These traits define the boundary between the convergence engine and the
//! remote control plane. The request/response mapping layer implements them
//! once per resource kind; the engine is written once against them.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Resource Kinds
// =============================================================================

/// Kinds of remote storage resources the engine converges
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Volume,
    Snapshot,
    Backup,
    Image,
    Share,
    ShareSnapshot,
    Replica,
}

impl ResourceKind {
    /// Label value used for metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Backup => "backup",
            ResourceKind::Image => "image",
            ResourceKind::Share => "share",
            ResourceKind::ShareSnapshot => "share_snapshot",
            ResourceKind::Replica => "replica",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Snapshot => write!(f, "snapshot"),
            ResourceKind::Backup => write!(f, "backup"),
            ResourceKind::Image => write!(f, "image"),
            ResourceKind::Share => write!(f, "share"),
            ResourceKind::ShareSnapshot => write!(f, "share snapshot"),
            ResourceKind::Replica => write!(f, "share replica"),
        }
    }
}

/// Kind-qualified resource identifier used in errors and log fields
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

// =============================================================================
// Observed Resources
// =============================================================================

/// A remote resource as last observed through the control plane.
///
/// `status` is backend-defined free text. Only the control plane mutates it;
/// the engine changes it solely through an explicit reset call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub status: String,
    pub availability_zone: Option<String>,
    /// Volume or share type, where the kind has one
    pub volume_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Resource this one was taken from, e.g. a snapshot's volume or share
    #[serde(default)]
    pub source_id: Option<String>,
}

impl ManagedResource {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.id.clone())
    }
}

/// Replication state of a share replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReplicationState {
    Active,
    InSync,
    Other(String),
}

impl ReplicationState {
    pub fn as_str(&self) -> &str {
        match self {
            ReplicationState::Active => "active",
            ReplicationState::InSync => "in_sync",
            ReplicationState::Other(state) => state,
        }
    }
}

impl From<&str> for ReplicationState {
    fn from(state: &str) -> Self {
        match state {
            "active" => ReplicationState::Active,
            "in_sync" => ReplicationState::InSync,
            other => ReplicationState::Other(other.to_string()),
        }
    }
}

impl From<String> for ReplicationState {
    fn from(state: String) -> Self {
        ReplicationState::from(state.as_str())
    }
}

impl From<ReplicationState> for String {
    fn from(state: ReplicationState) -> Self {
        state.as_str().to_string()
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secondary copy of a share pinned to one availability zone.
///
/// The control plane keeps at most one replica per share in the `active`
/// replication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub id: String,
    pub parent_resource_id: String,
    pub availability_zone: String,
    pub status: String,
    pub replication_state: ReplicationState,
}

impl ReplicaDescriptor {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::Replica, self.id.clone())
    }
}

// =============================================================================
// Provisioning Request
// =============================================================================

/// Request to create a resource on the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Kind of resource to create
    pub kind: ResourceKind,
    /// Name for the new resource
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Resource the new one is derived from
    pub source: Option<ResourceRef>,
    /// Requested placement, `None` lets the control plane decide
    pub availability_zone: Option<String>,
    /// Requested volume or share type
    pub volume_type: Option<String>,
    /// Metadata attached to the new resource
    pub metadata: BTreeMap<String, String>,
}

impl CreateRequest {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: String::new(),
            source: None,
            availability_zone: None,
            volume_type: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: ResourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_availability_zone(mut self, az: Option<String>) -> Self {
        self.availability_zone = az.filter(|az| !az.is_empty());
        self
    }

    pub fn with_volume_type(mut self, volume_type: Option<String>) -> Self {
        self.volume_type = volume_type.filter(|t| !t.is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Resource Backend Port
// =============================================================================

/// Port for the lifecycle operations of one resource kind.
///
/// Errors are expected to be classifiable: a missing resource surfaces as
/// `Error::NotFound`, a request rejected because of the current state as
/// `Error::Conflict`.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Kind served by this backend
    fn kind(&self) -> ResourceKind;

    /// Fetch the current state of a resource
    async fn get(&self, id: &str) -> Result<ManagedResource>;

    /// Request deletion of a resource
    async fn delete(&self, id: &str) -> Result<()>;

    /// Force the resource status to a known baseline
    async fn reset_status(&self, id: &str, status: &str) -> Result<()>;

    /// List resources of this kind that depend on `parent_id`
    async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<ManagedResource>>;
}

// =============================================================================
// Replica Backend Port
// =============================================================================

/// Port for share replica operations
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    async fn list_replicas(&self, parent_id: &str) -> Result<Vec<ReplicaDescriptor>>;

    async fn get_replica(&self, replica_id: &str) -> Result<ReplicaDescriptor>;

    async fn create_replica(&self, parent_id: &str, availability_zone: &str) -> Result<ReplicaDescriptor>;

    /// Start resynchronising a replica with the active one
    async fn resync(&self, replica_id: &str) -> Result<()>;

    /// Elevate a replica to become the active one
    async fn promote(&self, replica_id: &str) -> Result<()>;

    async fn delete_replica(&self, replica_id: &str) -> Result<()>;

    async fn reset_replica_status(&self, replica_id: &str, status: &str) -> Result<()>;
}

// =============================================================================
// Provisioner Port
// =============================================================================

/// Port for one-shot create calls
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a resource; it is returned in its initial transient state
    async fn create(&self, request: CreateRequest) -> Result<ManagedResource>;
}

// =============================================================================
// Volume Snapshotter Port
// =============================================================================

/// Plugin contract served by the backend stores.
///
/// Each call blocks its caller until the remote resources converge.
#[async_trait]
pub trait VolumeSnapshotter: Send + Sync {
    /// Snapshot a volume and return the snapshot identifier
    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_az: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Delete a snapshot created by `create_snapshot`
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Restore a new volume from a snapshot and return the volume identifier
    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_az: &str,
    ) -> Result<String>;

    /// Whether the volume is in one of the usable statuses
    async fn is_volume_ready(&self, volume_id: &str, volume_az: &str) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceBackendRef = Arc<dyn ResourceBackend>;
pub type ReplicaBackendRef = Arc<dyn ReplicaBackend>;
pub type ProvisionerRef = Arc<dyn Provisioner>;
