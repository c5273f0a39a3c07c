//! Storage Convergence - Resource-state convergence engine
//!
//! Drives remote storage resources (volumes, snapshots, backups, images,
//! shares and share replicas) to a desired state through an eventually
//! consistent control plane: waiting for statuses to settle, deleting with
//! error-state recovery, fanning deletes out over dependents and relocating
//! shares across availability zones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Volume Snapshotters                                │
//! │  ┌─────────────────────────────────┐  ┌─────────────────────────────────┐   │
//! │  │          BlockStore             │  │           FileStore             │   │
//! │  │ (snapshot/clone/backup/image)   │  │   (snapshot/clone, enforceAZ)   │   │
//! │  └────────────────┬────────────────┘  └────────────────┬────────────────┘   │
//! │                   └──────────────────┬─────────────────┘                    │
//! ├──────────────────────────────────────┼──────────────────────────────────────┤
//! │                         Convergence Engine                                  │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐  ┌───────────┐   │
//! │  │  AzMigrator  │─▶│ FanoutDeleter │─▶│ DeleteConvergence│─▶│  Status   │   │
//! │  │              │  │  (JoinSet)    │  │ (reset + retry)  │  │  Poller   │   │
//! │  └──────────────┘  └───────────────┘  └──────────────────┘  └───────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                       Control Plane Ports                                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────────┐     │
//! │  │ResourceBackend │  │ ReplicaBackend │  │        Provisioner         │     │
//! │  └────────────────┘  └────────────────┘  └────────────────────────────┘     │
//! │                 (SimulatedControlPlane serves all three)                    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`convergence`]: Poller, delete convergence, fan-out deleter and migrator
//! - [`controlplane`]: Block and file stores, simulated control plane
//! - [`config`]: Engine timing and store configuration
//! - [`domain`]: Resource model and port traits
//! - [`error`]: Error types and classification

pub mod config;
pub mod controlplane;
pub mod convergence;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use config::{
    BlockMethod, BlockStoreConfig, EngineConfig, FileMethod, FileStoreConfig, PluginConfig,
};

pub use controlplane::{
    BlockBackends, BlockStore, FileBackends, FileStore, SimOperation, SimulatedBackend,
    SimulatedControlPlane, SimulatorConfig, StoreFactory,
};

pub use convergence::{
    AzMigrator, CascadeError, ConvergenceEngine, ConvergenceMetrics, DeleteConvergence,
    DeleteMode, DeleteTarget, FanoutDeleter, MigrationReport, MigrationStep, Relocation,
    StatusPoller,
};

pub use domain::ports::{
    CreateRequest, ManagedResource, Provisioner, ReplicaBackend, ReplicaDescriptor,
    ReplicationState, ResourceBackend, ResourceKind, ResourceRef, VolumeSnapshotter,
};

pub use error::{Error, ErrorAction, ErrorClass, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
