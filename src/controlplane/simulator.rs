//! Simulated Control Plane
//!
//! In-memory, eventually-consistent stand-in for the Cinder/Manila style
//! APIs the stores talk to. Every mutating call returns at once and leaves
//! the resource in a transient status; subsequent reads advance it along a
//! scripted path. Faults can be injected per resource or per operation.

use crate::domain::ports::{
    CreateRequest, ManagedResource, Provisioner, ReplicaBackend, ReplicaDescriptor,
    ReplicationState, ResourceBackend, ResourceKind,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

const SERVICE: &str = "simulator";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated control plane
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Reads that still observe a transient status after a mutating call
    pub transient_observations: usize,
    /// Zone assigned when neither the request nor the source names one
    pub default_availability_zone: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            transient_observations: 1,
            default_availability_zone: "nova".to_string(),
        }
    }
}

/// Operations recorded in the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimOperation {
    Get,
    Delete,
    ResetStatus,
    ListByParent,
    Create,
    ListReplicas,
    GetReplica,
    CreateReplica,
    Resync,
    Promote,
    DeleteReplica,
    ResetReplicaStatus,
}

// =============================================================================
// Internal State
// =============================================================================

/// Next thing a read observes
#[derive(Debug, Clone)]
enum Observation {
    Status(String),
    Gone,
}

#[derive(Debug, Default)]
struct DeleteFaults {
    /// Deletes rejected with Conflict
    conflicts: u32,
    /// Deletes that end in `error_deleting`
    failures: u32,
    /// Deletes that never leave `deleting`
    stuck: bool,
}

#[derive(Debug)]
struct ResourceRecord {
    resource: ManagedResource,
    parent: Option<String>,
    script: VecDeque<Observation>,
    faults: DeleteFaults,
}

#[derive(Debug)]
struct ReplicaRecord {
    replica: ReplicaDescriptor,
    script: VecDeque<Observation>,
    states: VecDeque<ReplicationState>,
    faults: DeleteFaults,
    /// Resync leaves the replication state untouched
    frozen: bool,
}

#[derive(Debug, Default)]
struct PlaneState {
    resources: BTreeMap<String, ResourceRecord>,
    replicas: BTreeMap<String, ReplicaRecord>,
    failures: BTreeMap<SimOperation, VecDeque<String>>,
    journal: Vec<(SimOperation, String)>,
    next_id: u64,
}

impl PlaneState {
    /// Journal the call and consume an injected failure, if any
    fn enter(&mut self, op: SimOperation, id: &str) -> Result<()> {
        self.journal.push((op, id.to_string()));
        match self.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(reason) => Err(Error::Api {
                service: SERVICE.into(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn faults_mut(&mut self, id: &str) -> Option<&mut DeleteFaults> {
        if let Some(record) = self.resources.get_mut(id) {
            return Some(&mut record.faults);
        }
        self.replicas.get_mut(id).map(|record| &mut record.faults)
    }

    fn has_dependents(&self, id: &str) -> bool {
        self.resources
            .values()
            .any(|r| r.parent.as_deref() == Some(id))
            || self.replicas.values().any(|r| {
                r.replica.parent_resource_id == id
                    && r.replica.replication_state != ReplicationState::Active
            })
    }

    fn remove_resource(&mut self, id: &str) {
        self.resources.remove(id);
        self.replicas
            .retain(|_, r| r.replica.parent_resource_id != id);
    }
}

fn not_found(kind: ResourceKind, id: &str) -> Error {
    Error::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn conflict(kind: ResourceKind, id: &str, reason: &str) -> Error {
    Error::Conflict {
        kind,
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// Status path walked after a delete request
fn deletion_script(transient: usize, faults: &mut DeleteFaults) -> VecDeque<Observation> {
    let mut script: VecDeque<Observation> = (0..transient)
        .map(|_| Observation::Status("deleting".into()))
        .collect();
    if faults.stuck {
        script.push_back(Observation::Status("deleting".into()));
    } else if faults.failures > 0 {
        faults.failures -= 1;
        script.push_back(Observation::Status("error_deleting".into()));
    } else {
        script.push_back(Observation::Gone);
    }
    script
}

fn settle_script(transient: usize, transient_status: &str, final_status: &str) -> VecDeque<Observation> {
    (0..transient)
        .map(|_| Observation::Status(transient_status.to_string()))
        .chain(std::iter::once(Observation::Status(final_status.to_string())))
        .collect()
}

// =============================================================================
// Simulated Control Plane
// =============================================================================

/// In-memory control plane serving every port
pub struct SimulatedControlPlane {
    config: SimulatorConfig,
    state: Mutex<PlaneState>,
}

impl SimulatedControlPlane {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PlaneState::default()),
        }
    }

    // =========================================================================
    // Seeding and Fault Injection
    // =========================================================================

    /// Insert a settled resource
    pub fn seed(
        &self,
        kind: ResourceKind,
        id: &str,
        status: &str,
        availability_zone: Option<&str>,
    ) -> ManagedResource {
        self.insert(kind, id, status, availability_zone.map(String::from), None)
    }

    /// Insert a settled resource that depends on `parent_id`
    pub fn seed_child(&self, kind: ResourceKind, id: &str, parent_id: &str, status: &str) -> ManagedResource {
        let zone = self
            .resource(parent_id)
            .and_then(|parent| parent.availability_zone);
        self.insert(kind, id, status, zone, Some(parent_id.to_string()))
    }

    fn insert(
        &self,
        kind: ResourceKind,
        id: &str,
        status: &str,
        availability_zone: Option<String>,
        parent: Option<String>,
    ) -> ManagedResource {
        let resource = ManagedResource {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            status: status.to_string(),
            availability_zone,
            volume_type: None,
            metadata: BTreeMap::new(),
            source_id: parent.clone(),
        };
        self.state.lock().resources.insert(
            id.to_string(),
            ResourceRecord {
                resource: resource.clone(),
                parent,
                script: VecDeque::new(),
                faults: DeleteFaults::default(),
            },
        );
        resource
    }

    /// Insert a settled replica of `parent_id`
    pub fn seed_replica(
        &self,
        parent_id: &str,
        id: &str,
        availability_zone: &str,
        status: &str,
        state: ReplicationState,
    ) -> ReplicaDescriptor {
        let replica = ReplicaDescriptor {
            id: id.to_string(),
            parent_resource_id: parent_id.to_string(),
            availability_zone: availability_zone.to_string(),
            status: status.to_string(),
            replication_state: state,
        };
        self.state.lock().replicas.insert(
            id.to_string(),
            ReplicaRecord {
                replica: replica.clone(),
                script: VecDeque::new(),
                states: VecDeque::new(),
                faults: DeleteFaults::default(),
                frozen: false,
            },
        );
        replica
    }

    /// Set a metadata entry on resource `id`
    pub fn tag(&self, id: &str, key: &str, value: &str) {
        if let Some(record) = self.state.lock().resources.get_mut(id) {
            record
                .resource
                .metadata
                .insert(key.to_string(), value.to_string());
        }
    }

    /// Statuses the next reads of `id` observe, in order
    pub fn script_statuses(&self, id: &str, statuses: &[&str]) {
        let script: VecDeque<Observation> = statuses
            .iter()
            .map(|s| Observation::Status(s.to_string()))
            .collect();
        let mut state = self.state.lock();
        if let Some(record) = state.resources.get_mut(id) {
            record.script = script;
        } else if let Some(record) = state.replicas.get_mut(id) {
            record.script = script;
        }
    }

    /// The next `count` deletes of `id` end in `error_deleting`
    pub fn fail_deletes(&self, id: &str, count: u32) {
        if let Some(faults) = self.state.lock().faults_mut(id) {
            faults.failures = count;
        }
    }

    /// The next `count` deletes of `id` are rejected with Conflict
    pub fn conflict_deletes(&self, id: &str, count: u32) {
        if let Some(faults) = self.state.lock().faults_mut(id) {
            faults.conflicts = count;
        }
    }

    /// Deletes of `id` never complete
    pub fn stick_in_deleting(&self, id: &str) {
        if let Some(faults) = self.state.lock().faults_mut(id) {
            faults.stuck = true;
        }
    }

    /// Resyncing replica `id` never reaches `in_sync`
    pub fn freeze_replication(&self, id: &str) {
        if let Some(record) = self.state.lock().replicas.get_mut(id) {
            record.frozen = true;
        }
    }

    /// The next call of `op` fails with an API error
    pub fn fail_next(&self, op: SimOperation, reason: &str) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(reason.to_string());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current state of a resource, without advancing its script
    pub fn resource(&self, id: &str) -> Option<ManagedResource> {
        self.state
            .lock()
            .resources
            .get(id)
            .map(|r| r.resource.clone())
    }

    pub fn replica(&self, id: &str) -> Option<ReplicaDescriptor> {
        self.state.lock().replicas.get(id).map(|r| r.replica.clone())
    }

    pub fn replicas_of(&self, parent_id: &str) -> Vec<ReplicaDescriptor> {
        self.state
            .lock()
            .replicas
            .values()
            .filter(|r| r.replica.parent_resource_id == parent_id)
            .map(|r| r.replica.clone())
            .collect()
    }

    /// Resources of `kind` currently present
    pub fn resources_of_kind(&self, kind: ResourceKind) -> Vec<ManagedResource> {
        self.state
            .lock()
            .resources
            .values()
            .filter(|r| r.resource.kind == kind)
            .map(|r| r.resource.clone())
            .collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        let state = self.state.lock();
        state.resources.contains_key(id) || state.replicas.contains_key(id)
    }

    pub fn call_count(&self, op: SimOperation) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    /// Ids passed to `op`, in call order
    pub fn calls(&self, op: SimOperation) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, id)| id.clone())
            .collect()
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    fn get_resource(&self, kind: ResourceKind, id: &str) -> Result<ManagedResource> {
        let mut state = self.state.lock();
        state.enter(SimOperation::Get, id)?;

        let record = match state.resources.get_mut(id) {
            Some(record) if record.resource.kind == kind => record,
            _ => return Err(not_found(kind, id)),
        };
        match record.script.pop_front() {
            Some(Observation::Status(status)) => {
                trace!(resource = id, status = %status, "simulated status transition");
                record.resource.status = status;
                Ok(record.resource.clone())
            }
            Some(Observation::Gone) => {
                debug!(resource = id, "simulated resource removed");
                state.remove_resource(id);
                Err(not_found(kind, id))
            }
            None => Ok(record.resource.clone()),
        }
    }

    fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::Delete, id)?;

        if !matches!(state.resources.get(id), Some(r) if r.resource.kind == kind) {
            return Err(not_found(kind, id));
        }
        if state.has_dependents(id) {
            return Err(conflict(kind, id, "resource has dependent resources"));
        }

        let transient = self.config.transient_observations;
        let record = match state.resources.get_mut(id) {
            Some(record) => record,
            None => return Err(not_found(kind, id)),
        };
        if record.faults.conflicts > 0 {
            record.faults.conflicts -= 1;
            return Err(conflict(kind, id, "resource is busy"));
        }
        record.resource.status = "deleting".into();
        record.script = deletion_script(transient, &mut record.faults);
        Ok(())
    }

    fn reset_resource(&self, kind: ResourceKind, id: &str, status: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::ResetStatus, id)?;

        match state.resources.get_mut(id) {
            Some(record) if record.resource.kind == kind => {
                record.resource.status = status.to_string();
                record.script.clear();
                Ok(())
            }
            _ => Err(not_found(kind, id)),
        }
    }

    fn list_resources_by_parent(&self, kind: ResourceKind, parent_id: &str) -> Result<Vec<ManagedResource>> {
        let mut state = self.state.lock();
        state.enter(SimOperation::ListByParent, parent_id)?;

        Ok(state
            .resources
            .values()
            .filter(|r| r.resource.kind == kind && r.parent.as_deref() == Some(parent_id))
            .map(|r| r.resource.clone())
            .collect())
    }
}

// =============================================================================
// Port Implementations
// =============================================================================

#[async_trait]
impl Provisioner for SimulatedControlPlane {
    async fn create(&self, request: CreateRequest) -> Result<ManagedResource> {
        let mut state = self.state.lock();
        state.enter(SimOperation::Create, &request.name)?;

        let source = match &request.source {
            Some(source) => match state.resources.get(&source.id) {
                Some(record) if record.resource.kind == source.kind => Some(record.resource.clone()),
                _ => return Err(not_found(source.kind, &source.id)),
            },
            None => None,
        };

        let availability_zone = request
            .availability_zone
            .clone()
            .or_else(|| source.as_ref().and_then(|s| s.availability_zone.clone()))
            .unwrap_or_else(|| self.config.default_availability_zone.clone());
        let volume_type = request
            .volume_type
            .clone()
            .or_else(|| source.as_ref().and_then(|s| s.volume_type.clone()));
        let parent = match request.kind {
            ResourceKind::Snapshot | ResourceKind::ShareSnapshot => {
                source.as_ref().map(|s| s.id.clone())
            }
            _ => None,
        };
        let ready = match request.kind {
            ResourceKind::Image => "active",
            _ => "available",
        };

        let id = state.allocate_id(request.kind.as_label());
        let resource = ManagedResource {
            id: id.clone(),
            kind: request.kind,
            name: request.name,
            status: "creating".into(),
            availability_zone: Some(availability_zone.clone()),
            volume_type,
            metadata: request.metadata,
            source_id: source.as_ref().map(|s| s.id.clone()),
        };
        debug!(resource = %resource.resource_ref(), zone = %availability_zone, "simulated create");

        state.resources.insert(
            id.clone(),
            ResourceRecord {
                resource: resource.clone(),
                parent,
                script: settle_script(self.config.transient_observations, "creating", ready),
                faults: DeleteFaults::default(),
            },
        );

        if request.kind == ResourceKind::Share {
            let replica_id = state.allocate_id("replica");
            state.replicas.insert(
                replica_id.clone(),
                ReplicaRecord {
                    replica: ReplicaDescriptor {
                        id: replica_id,
                        parent_resource_id: id,
                        availability_zone,
                        status: "available".into(),
                        replication_state: ReplicationState::Active,
                    },
                    script: VecDeque::new(),
                    states: VecDeque::new(),
                    faults: DeleteFaults::default(),
                    frozen: false,
                },
            );
        }

        Ok(resource)
    }
}

#[async_trait]
impl ReplicaBackend for SimulatedControlPlane {
    async fn list_replicas(&self, parent_id: &str) -> Result<Vec<ReplicaDescriptor>> {
        let mut state = self.state.lock();
        state.enter(SimOperation::ListReplicas, parent_id)?;

        if !state.resources.contains_key(parent_id) {
            return Err(not_found(ResourceKind::Share, parent_id));
        }
        Ok(state
            .replicas
            .values()
            .filter(|r| r.replica.parent_resource_id == parent_id)
            .map(|r| r.replica.clone())
            .collect())
    }

    async fn get_replica(&self, replica_id: &str) -> Result<ReplicaDescriptor> {
        let mut state = self.state.lock();
        state.enter(SimOperation::GetReplica, replica_id)?;

        let record = state
            .replicas
            .get_mut(replica_id)
            .ok_or_else(|| not_found(ResourceKind::Replica, replica_id))?;
        if let Some(next) = record.states.pop_front() {
            record.replica.replication_state = next;
        }
        match record.script.pop_front() {
            Some(Observation::Status(status)) => {
                record.replica.status = status;
                Ok(record.replica.clone())
            }
            Some(Observation::Gone) => {
                debug!(replica = replica_id, "simulated replica removed");
                state.replicas.remove(replica_id);
                Err(not_found(ResourceKind::Replica, replica_id))
            }
            None => Ok(record.replica.clone()),
        }
    }

    async fn create_replica(&self, parent_id: &str, availability_zone: &str) -> Result<ReplicaDescriptor> {
        let mut state = self.state.lock();
        state.enter(SimOperation::CreateReplica, parent_id)?;

        if !state.resources.contains_key(parent_id) {
            return Err(not_found(ResourceKind::Share, parent_id));
        }
        let id = state.allocate_id("replica");
        let replica = ReplicaDescriptor {
            id: id.clone(),
            parent_resource_id: parent_id.to_string(),
            availability_zone: availability_zone.to_string(),
            status: "creating".into(),
            replication_state: ReplicationState::Other("out_of_sync".into()),
        };
        state.replicas.insert(
            id,
            ReplicaRecord {
                replica: replica.clone(),
                script: settle_script(self.config.transient_observations, "creating", "available"),
                states: VecDeque::new(),
                faults: DeleteFaults::default(),
                frozen: false,
            },
        );
        Ok(replica)
    }

    async fn resync(&self, replica_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::Resync, replica_id)?;

        let transient = self.config.transient_observations;
        let record = state
            .replicas
            .get_mut(replica_id)
            .ok_or_else(|| not_found(ResourceKind::Replica, replica_id))?;
        if record.replica.replication_state == ReplicationState::Active {
            return Err(conflict(ResourceKind::Replica, replica_id, "active replica cannot be resynced"));
        }
        if !record.frozen {
            record.states = (0..transient)
                .map(|_| ReplicationState::Other("out_of_sync".into()))
                .chain(std::iter::once(ReplicationState::InSync))
                .collect();
        }
        Ok(())
    }

    async fn promote(&self, replica_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::Promote, replica_id)?;

        let transient = self.config.transient_observations;
        let (parent_id, zone) = match state.replicas.get(replica_id) {
            Some(record) if record.replica.replication_state == ReplicationState::InSync => (
                record.replica.parent_resource_id.clone(),
                record.replica.availability_zone.clone(),
            ),
            Some(_) => {
                return Err(conflict(ResourceKind::Replica, replica_id, "replica is not in sync"))
            }
            None => return Err(not_found(ResourceKind::Replica, replica_id)),
        };

        for record in state.replicas.values_mut() {
            if record.replica.parent_resource_id == parent_id
                && record.replica.replication_state == ReplicationState::Active
            {
                record.replica.replication_state = ReplicationState::InSync;
            }
        }
        if let Some(record) = state.replicas.get_mut(replica_id) {
            record.states = (0..transient)
                .map(|_| ReplicationState::InSync)
                .chain(std::iter::once(ReplicationState::Active))
                .collect();
        }
        if let Some(parent) = state.resources.get_mut(&parent_id) {
            debug!(resource = %parent_id, zone = %zone, "simulated promote moved parent");
            parent.resource.availability_zone = Some(zone);
            parent.resource.status = "replication_change".into();
            parent.script = settle_script(transient, "replication_change", "available");
        }
        Ok(())
    }

    async fn delete_replica(&self, replica_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::DeleteReplica, replica_id)?;

        let transient = self.config.transient_observations;
        let parent_id = state
            .replicas
            .get(replica_id)
            .map(|record| record.replica.parent_resource_id.clone())
            .ok_or_else(|| not_found(ResourceKind::Replica, replica_id))?;
        let other_active = state.replicas.values().any(|record| {
            record.replica.id != replica_id
                && record.replica.parent_resource_id == parent_id
                && record.replica.replication_state == ReplicationState::Active
        });
        let record = state
            .replicas
            .get_mut(replica_id)
            .ok_or_else(|| not_found(ResourceKind::Replica, replica_id))?;
        if record.replica.replication_state == ReplicationState::Active && !other_active {
            return Err(conflict(ResourceKind::Replica, replica_id, "last active replica cannot be deleted"));
        }
        if record.faults.conflicts > 0 {
            record.faults.conflicts -= 1;
            return Err(conflict(ResourceKind::Replica, replica_id, "replica is busy"));
        }
        record.replica.status = "deleting".into();
        record.script = deletion_script(transient, &mut record.faults);
        Ok(())
    }

    async fn reset_replica_status(&self, replica_id: &str, status: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(SimOperation::ResetReplicaStatus, replica_id)?;

        let record = state
            .replicas
            .get_mut(replica_id)
            .ok_or_else(|| not_found(ResourceKind::Replica, replica_id))?;
        record.replica.status = status.to_string();
        record.script.clear();
        Ok(())
    }
}

/// [`ResourceBackend`] view of one resource kind on the simulated plane
pub struct SimulatedBackend {
    plane: Arc<SimulatedControlPlane>,
    kind: ResourceKind,
}

impl SimulatedBackend {
    pub fn new(plane: Arc<SimulatedControlPlane>, kind: ResourceKind) -> Self {
        Self { plane, kind }
    }
}

#[async_trait]
impl ResourceBackend for SimulatedBackend {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn get(&self, id: &str) -> Result<ManagedResource> {
        self.plane.get_resource(self.kind, id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.plane.delete_resource(self.kind, id)
    }

    async fn reset_status(&self, id: &str, status: &str) -> Result<()> {
        self.plane.reset_resource(self.kind, id, status)
    }

    async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<ManagedResource>> {
        self.plane.list_resources_by_parent(self.kind, parent_id)
    }
}
