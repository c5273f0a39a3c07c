//! Status and error classification
//!
//! The engine never interprets backend statuses beyond two questions: is the
//! status in the caller's accepted set, and does it look like an error.

use crate::domain::ports::{ManagedResource, ReplicaDescriptor};

/// Sentinel accepted status meaning "the resource is gone (404)"
pub const DELETED: &str = "deleted";

/// Baseline status from which the control plane accepts a delete
pub const ERROR_BASELINE: &str = "error";

/// Classification of an observed status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Member of the accepted set
    Accepted,
    /// Error-like; only a reset can clear it
    ErrorState,
    /// Still transitioning
    Transient,
}

/// Classify `status` against the caller-supplied accepted set.
///
/// Membership in `accept` takes precedence over the error test.
pub fn classify_status(status: &str, accept: &[&str]) -> StatusClass {
    if accept.contains(&status) {
        StatusClass::Accepted
    } else if status.contains("error") {
        StatusClass::ErrorState
    } else {
        StatusClass::Transient
    }
}

/// Whether the accepted set treats absence as success
pub fn accepts_deleted(accept: &[&str]) -> bool {
    accept.contains(&DELETED)
}

/// Something whose status can be polled
pub trait Observed {
    fn observed_status(&self) -> &str;
}

impl Observed for ManagedResource {
    fn observed_status(&self) -> &str {
        &self.status
    }
}

impl Observed for ReplicaDescriptor {
    fn observed_status(&self) -> &str {
        &self.status
    }
}

/// Polls a replica by its replication state rather than its status
#[derive(Debug, Clone)]
pub struct ReplicationStateView(pub ReplicaDescriptor);

impl Observed for ReplicationStateView {
    fn observed_status(&self) -> &str {
        self.0.replication_state.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ReplicationState;

    #[test]
    fn test_classify_status() {
        let accept = ["available", "in-use"];
        assert_eq!(classify_status("available", &accept), StatusClass::Accepted);
        assert_eq!(classify_status("in-use", &accept), StatusClass::Accepted);
        assert_eq!(classify_status("creating", &accept), StatusClass::Transient);
        assert_eq!(classify_status("error", &accept), StatusClass::ErrorState);
        assert_eq!(
            classify_status("error_deleting", &accept),
            StatusClass::ErrorState
        );
    }

    #[test]
    fn test_accepted_wins_over_error_substring() {
        assert_eq!(classify_status("error", &["error"]), StatusClass::Accepted);
    }

    #[test]
    fn test_accepts_deleted() {
        assert!(accepts_deleted(&[DELETED]));
        assert!(!accepts_deleted(&["available"]));
    }

    #[test]
    fn test_replication_state_view() {
        let replica = ReplicaDescriptor {
            id: "r1".into(),
            parent_resource_id: "s1".into(),
            availability_zone: "az1".into(),
            status: "available".into(),
            replication_state: ReplicationState::InSync,
        };
        assert_eq!(replica.observed_status(), "available");
        assert_eq!(ReplicationStateView(replica).observed_status(), "in_sync");
    }
}
