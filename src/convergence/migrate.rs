//! Availability Zone Migrator
//!
//! Relocates a resource to another availability zone through a replica:
//!
//! ```text
//! NoTargetReplica ──acquire──▶ ReplicaReady ──resync──▶ Resyncing ──▶ InSync
//!                                                                      │
//!       Done ◀── OldReplicaCleanup ◀── ActiveInTargetAz ◀── Promoting ◀┘
//! ```
//!
//! Nothing is rolled back. A failure is reported with the step it happened
//! in, so a caller can tell "never started" from "partially applied".

use crate::convergence::classify::ReplicationStateView;
use crate::convergence::delete::{DeleteConvergence, DeleteMode, ReplicaTarget};
use crate::convergence::metrics::{ConvergenceMetrics, MigrationOutcome};
use crate::convergence::poller::StatusPoller;
use crate::domain::ports::{
    ReplicaBackend, ReplicaDescriptor, ReplicationState, ResourceBackend, ResourceKind,
    ResourceRef,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of a usable replica and of a settled parent resource
const AVAILABLE: &str = "available";

// =============================================================================
// Steps and States
// =============================================================================

/// Step of the migration protocol a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    Discover,
    AcquireReplica,
    Resync,
    Promote,
    Verify,
    Decommission,
}

impl MigrationStep {
    /// Whether a failure at this step may leave the resource partially moved
    pub fn is_partially_applied(&self) -> bool {
        matches!(
            self,
            MigrationStep::Promote | MigrationStep::Verify | MigrationStep::Decommission
        )
    }
}

impl std::fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStep::Discover => write!(f, "discover"),
            MigrationStep::AcquireReplica => write!(f, "acquire replica"),
            MigrationStep::Resync => write!(f, "resync"),
            MigrationStep::Promote => write!(f, "promote"),
            MigrationStep::Verify => write!(f, "verify"),
            MigrationStep::Decommission => write!(f, "decommission"),
        }
    }
}

/// Externally observable migration states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NoTargetReplica,
    ReplicaReady,
    Resyncing,
    InSync,
    Promoting,
    ActiveInTargetAz,
    OldReplicaCleanup,
    Done,
}

/// Wait budgets of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationTimeouts {
    /// Replica creation, resync, promote and old replica removal
    pub replica: Duration,
    /// Parent resource settling in the target zone
    pub resource: Duration,
}

impl Default for MigrationTimeouts {
    fn default() -> Self {
        Self {
            replica: Duration::from_secs(300),
            resource: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// What a completed migration did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Relocation {
    /// The active replica already lived in the target zone
    AlreadyInPlace,
    Migrated {
        replica_id: String,
        created_replica: bool,
        old_replica_id: String,
    },
}

/// Summary of a completed migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub resource_id: String,
    pub target_az: String,
    pub outcome: Relocation,
    pub states: Vec<MigrationState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.outcome == Relocation::AlreadyInPlace
    }
}

// =============================================================================
// Migrator
// =============================================================================

/// Replica-based availability zone migrator
#[derive(Clone)]
pub struct AzMigrator {
    replicas: Arc<dyn ReplicaBackend>,
    parents: Arc<dyn ResourceBackend>,
    poller: StatusPoller,
    deleter: DeleteConvergence,
    mode: DeleteMode,
    timeouts: MigrationTimeouts,
    metrics: Arc<ConvergenceMetrics>,
}

impl AzMigrator {
    pub fn new(
        replicas: Arc<dyn ReplicaBackend>,
        parents: Arc<dyn ResourceBackend>,
        poller: StatusPoller,
        deleter: DeleteConvergence,
        metrics: Arc<ConvergenceMetrics>,
    ) -> Self {
        Self {
            replicas,
            parents,
            poller,
            deleter,
            mode: DeleteMode::BestEffort,
            timeouts: MigrationTimeouts::default(),
            metrics,
        }
    }

    /// How the previously active replica is removed
    pub fn with_mode(mut self, mode: DeleteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeouts(mut self, timeouts: MigrationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Move `resource_id` so that its active replica lives in `target_az`
    pub async fn migrate(
        &self,
        resource_id: &str,
        target_az: &str,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let mut states = Vec::new();

        match self.run(resource_id, target_az, cancel, &mut states).await {
            Ok(outcome) => {
                self.metrics.record_migration(match outcome {
                    Relocation::AlreadyInPlace => MigrationOutcome::Noop,
                    Relocation::Migrated { .. } => MigrationOutcome::Migrated,
                });
                Ok(MigrationReport {
                    resource_id: resource_id.to_string(),
                    target_az: target_az.to_string(),
                    outcome,
                    states,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(e) => {
                self.metrics.record_migration(MigrationOutcome::Failed);
                warn!(resource_id, target_az, states = ?states, error = %e, "availability zone migration failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        resource_id: &str,
        target_az: &str,
        cancel: &CancellationToken,
        states: &mut Vec<MigrationState>,
    ) -> Result<Relocation> {
        let mut enter = |state: MigrationState| {
            info!(resource_id, target_az, state = ?state, "migration state");
            states.push(state);
        };

        // Discover
        let replicas = step(MigrationStep::Discover, resource_id, async {
            self.replicas.list_replicas(resource_id).await
        })
        .await?;
        let active = replicas
            .iter()
            .find(|r| is_active(r))
            .cloned()
            .ok_or_else(|| {
                Error::migration(
                    MigrationStep::Discover,
                    resource_id,
                    Error::NoActiveReplica {
                        resource_id: resource_id.to_string(),
                    },
                )
            })?;

        if active.availability_zone == target_az {
            info!(resource_id, target_az, replica = %active.id, "active replica already in target availability zone");
            enter(MigrationState::Done);
            return Ok(Relocation::AlreadyInPlace);
        }

        // Acquire
        let existing = replicas
            .iter()
            .find(|r| r.id != active.id && r.availability_zone == target_az && r.status == AVAILABLE)
            .cloned();
        let (target, created_replica) = match existing {
            Some(replica) => {
                info!(resource_id, replica = %replica.id, "reusing replica in target availability zone");
                enter(MigrationState::ReplicaReady);
                (replica, false)
            }
            None => {
                enter(MigrationState::NoTargetReplica);
                let replica = step(MigrationStep::AcquireReplica, resource_id, async {
                    let created = self.replicas.create_replica(resource_id, target_az).await?;
                    info!(resource_id, replica = %created.id, target_az, "created replica");
                    self.await_replica(&created.id, cancel).await
                })
                .await?;
                enter(MigrationState::ReplicaReady);
                (replica, true)
            }
        };
        let replica_ref = target.resource_ref();

        // Resync
        enter(MigrationState::Resyncing);
        step(MigrationStep::Resync, resource_id, async {
            self.replicas.resync(&target.id).await?;
            self.await_replication_state(&replica_ref, ReplicationState::InSync, cancel)
                .await
        })
        .await?;
        enter(MigrationState::InSync);

        // Promote
        enter(MigrationState::Promoting);
        step(MigrationStep::Promote, resource_id, async {
            self.replicas.promote(&target.id).await?;
            self.await_replication_state(&replica_ref, ReplicationState::Active, cancel)
                .await
        })
        .await?;
        enter(MigrationState::ActiveInTargetAz);

        // Verify
        step(MigrationStep::Verify, resource_id, async {
            let parent_ref = ResourceRef::new(self.parents.kind(), resource_id);
            let parents = &self.parents;
            let parent = self
                .poller
                .await_status(&parent_ref, &[AVAILABLE], self.timeouts.resource, cancel, || {
                    parents.get(resource_id)
                })
                .await?
                .ok_or_else(|| Error::NotFound {
                    kind: parent_ref.kind,
                    id: resource_id.to_string(),
                })?;
            if parent.availability_zone.as_deref() != Some(target_az) {
                return Err(Error::AvailabilityZoneMismatch {
                    resource_id: resource_id.to_string(),
                    expected: target_az.to_string(),
                    actual: parent.availability_zone,
                });
            }
            Ok(())
        })
        .await?;

        // Decommission
        enter(MigrationState::OldReplicaCleanup);
        step(MigrationStep::Decommission, resource_id, async {
            self.remove_replica(&active.id, cancel).await
        })
        .await?;
        enter(MigrationState::Done);

        Ok(Relocation::Migrated {
            replica_id: target.id,
            created_replica,
            old_replica_id: active.id,
        })
    }

    async fn await_replica(&self, replica_id: &str, cancel: &CancellationToken) -> Result<ReplicaDescriptor> {
        let target = ResourceRef::new(ResourceKind::Replica, replica_id);
        let replicas = &self.replicas;
        self.poller
            .await_status(&target, &[AVAILABLE], self.timeouts.replica, cancel, || {
                replicas.get_replica(replica_id)
            })
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Replica,
                id: replica_id.to_string(),
            })
    }

    async fn await_replication_state(
        &self,
        target: &ResourceRef,
        state: ReplicationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let replicas = &self.replicas;
        let id = target.id.as_str();
        debug!(replica = %target, state = %state, "waiting for replication state");
        self.poller
            .await_status(target, &[state.as_str()], self.timeouts.replica, cancel, || async move {
                replicas.get_replica(id).await.map(ReplicationStateView)
            })
            .await
            .map(|_| ())
    }

    async fn remove_replica(&self, replica_id: &str, cancel: &CancellationToken) -> Result<()> {
        match self.mode {
            DeleteMode::Ensure => {
                let target = ReplicaTarget::new(self.replicas.clone(), replica_id);
                self.deleter
                    .ensure_deleted(&target, self.timeouts.replica, cancel)
                    .await
            }
            DeleteMode::BestEffort => match self.replicas.delete_replica(replica_id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        }
    }
}

/// The replica currently serving the share
pub(crate) fn is_active(replica: &ReplicaDescriptor) -> bool {
    replica.replication_state == ReplicationState::Active && replica.status == AVAILABLE
}

/// Attribute the failure of `work` to `step`
async fn step<T>(
    step: MigrationStep,
    resource_id: &str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    work.await
        .map_err(|e| Error::migration(step, resource_id, e))
}
