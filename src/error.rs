//! Error types for the convergence engine
//!
//! Provides structured error types for remote control-plane calls, status
//! convergence, cascading deletes, availability-zone migration and
//! configuration.

use crate::convergence::fanout::CascadeError;
use crate::convergence::migrate::MigrationStep;
use crate::domain::ports::{ResourceKind, ResourceRef};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote API Errors
    // =========================================================================
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("conflicting request for {kind} {id}: {reason}")]
    Conflict {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    #[error("{service} API error: {reason}")]
    Api { service: String, reason: String },

    #[error("{resource} does not name the resource it was taken from")]
    MissingOrigin { resource: ResourceRef },

    // =========================================================================
    // Convergence Errors
    // =========================================================================
    #[error("{resource} has unexpected {status} status")]
    ErrorState { resource: ResourceRef, status: String },

    #[error("wait time exceeded for {resource}: {timeout:?}")]
    Timeout {
        resource: ResourceRef,
        timeout: Duration,
    },

    #[error("operation on {resource} was cancelled")]
    Cancelled { resource: ResourceRef },

    #[error(transparent)]
    Cascade(#[from] CascadeError),

    // =========================================================================
    // Migration Errors
    // =========================================================================
    #[error("availability zone migration of {resource_id} failed at {step} step: {source}")]
    Migration {
        step: MigrationStep,
        resource_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no active replica found for {resource_id}")]
    NoActiveReplica { resource_id: String },

    #[error("{resource_id} is in availability zone {actual:?} instead of {expected}")]
    AvailabilityZoneMismatch {
        resource_id: String,
        expected: String,
        actual: Option<String>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("unsupported {method:?} snapshot method, supported methods: {supported:?}")]
    UnsupportedMethod {
        method: String,
        supported: &'static [&'static str],
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Metrics / IO Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote-call error category used by the convergence loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource is absent
    NotFound,
    /// The request clashed with the current state; retry without a reset
    Conflict,
    /// Anything else; passed through
    Other,
}

/// What a top-level caller should do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-running the whole operation is safe
    Retry,
    /// Remote state was partially changed; inspect before retrying
    ManualIntervention,
    /// Retrying cannot succeed without a configuration change
    NoRetry,
}

impl Error {
    /// Wrap a failure of a migration step
    pub fn migration(step: MigrationStep, resource_id: impl Into<String>, source: Error) -> Self {
        Error::Migration {
            step,
            resource_id: resource_id.into(),
            source: Box::new(source),
        }
    }

    /// Classify a remote-call error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound { .. } => ErrorClass::NotFound,
            Error::Conflict { .. } => ErrorClass::Conflict,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_error_state(&self) -> bool {
        matches!(self, Error::ErrorState { .. })
    }

    /// Failed migration step, if this is a migration error
    pub fn migration_step(&self) -> Option<MigrationStep> {
        match self {
            Error::Migration { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Determine what a caller should do about this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Migration { step, .. } if step.is_partially_applied() => {
                ErrorAction::ManualIntervention
            }

            Error::Configuration(_)
            | Error::DurationParse(_)
            | Error::UnsupportedMethod { .. }
            | Error::MissingOrigin { .. }
            | Error::Yaml(_)
            | Error::Json(_) => ErrorAction::NoRetry,

            // Idempotent naming and NotFound-as-success make the rest safe to re-run
            _ => ErrorAction::Retry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.action() == ErrorAction::Retry
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        let err = Error::NotFound {
            kind: ResourceKind::Snapshot,
            id: "snap-1".into(),
        };
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(err.is_not_found());

        let err = Error::Conflict {
            kind: ResourceKind::Volume,
            id: "vol-1".into(),
            reason: "volume has snapshots".into(),
        };
        assert_eq!(err.class(), ErrorClass::Conflict);

        let err = Error::Api {
            service: "cinder".into(),
            reason: "500".into(),
        };
        assert_eq!(err.class(), ErrorClass::Other);
    }

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout {
            resource: ResourceRef::new(ResourceKind::Volume, "vol-1"),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.action(), ErrorAction::Retry);
        assert!(err.is_retryable());

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let cause = Error::Api {
            service: "manila".into(),
            reason: "boom".into(),
        };
        let err = Error::migration(MigrationStep::Promote, "share-1", cause);
        assert_eq!(err.action(), ErrorAction::ManualIntervention);
        assert_eq!(err.migration_step(), Some(MigrationStep::Promote));

        let cause = Error::NoActiveReplica {
            resource_id: "share-1".into(),
        };
        let err = Error::migration(MigrationStep::Discover, "share-1", cause);
        assert_eq!(err.action(), ErrorAction::Retry);
    }

    #[test]
    fn test_error_messages_name_the_resource() {
        let err = Error::ErrorState {
            resource: ResourceRef::new(ResourceKind::Snapshot, "snap-9"),
            status: "error_deleting".into(),
        };
        assert_eq!(
            err.to_string(),
            "snapshot snap-9 has unexpected error_deleting status"
        );

        let err = Error::migration(
            MigrationStep::Promote,
            "share-1",
            Error::Api {
                service: "manila".into(),
                reason: "boom".into(),
            },
        );
        assert!(err.to_string().contains("promote"));
        assert!(err.to_string().contains("share-1"));
    }
}
