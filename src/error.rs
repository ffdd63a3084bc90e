//! Error types for the Terrastack planning system.
//!
//! This module provides the error hierarchy for every phase of a session:
//! configuration, graph construction, reference resolution, state backend
//! coordination and apply.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful (or no-op) session.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for a rejected plan (cycle, duplicate id, unresolved reference).
pub const EXIT_PLAN_REJECTED: u8 = 1;

/// Exit code for lock contention on the state backend.
pub const EXIT_LOCK_CONTENTION: u8 = 2;

/// Exit code for a session where one or more operations failed.
pub const EXIT_OPERATIONS_FAILED: u8 = 3;

/// The main error type for the Terrastack system.
#[derive(Debug, Error)]
pub enum TerrastackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction and resolution errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State backend errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply errors that abort a whole session.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Structural errors raised while building or resolving the dependency graph.
///
/// All of these are fatal and raised before any apply begins.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The members of the shortest cycle found, first member repeated at the end.
        cycle: Vec<String>,
    },

    /// An identifier was registered twice.
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId {
        /// What kind of id collided (stack, resource).
        kind: String,
        /// The duplicated id.
        id: String,
    },

    /// A reference could not be resolved.
    #[error("Unresolved reference from {from} to {target}: {reason}")]
    UnresolvedReference {
        /// Address of the referencing resource or stack output.
        from: String,
        /// Textual form of the reference target.
        target: String,
        /// Why it could not be resolved.
        reason: String,
    },
}

/// State backend errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A live lock with a different holder exists.
    #[error("State {key} is locked by {holder} (since {since}, expires {expires_at})")]
    LockContention {
        /// Backend key that is locked.
        key: String,
        /// Identity of the current lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
        /// When the lock expires.
        expires_at: String,
    },

    /// The presented token is no longer the current lock holder's token.
    #[error("Stale write to {key}: lock token {token} is no longer current")]
    StaleWrite {
        /// Backend key written to.
        key: String,
        /// The superseded token.
        token: String,
    },

    /// Snapshot version did not advance.
    #[error("Snapshot version mismatch: expected greater than {expected}, found {found}")]
    VersionMismatch {
        /// Version currently stored.
        expected: u64,
        /// Version presented.
        found: u64,
    },

    /// Stored state is corrupted or unreadable.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock operation failed for a reason other than contention.
    #[error("Failed to operate on state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Backend storage error.
    #[error("{backend} state backend error: {message}")]
    Backend {
        /// Backend type name.
        backend: &'static str,
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Errors that abort the apply phase of a session as a whole.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The apply was aborted before dispatching any operation.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The worker pool could not be driven to completion.
    #[error("Apply engine failure: {message}")]
    Engine {
        /// Description of the failure.
        message: String,
    },
}

/// Failure of a single resource operation.
///
/// These never abort a session: they fail only the resource's dependent subtree.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct ResourceApplyError {
    /// Description of the failure.
    pub message: String,
    /// Whether re-running the operation may succeed.
    pub retryable: bool,
}

/// Result type alias for Terrastack operations.
pub type Result<T> = std::result::Result<T, TerrastackError>;

impl TerrastackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable by the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::LockContention { .. } | StateError::Backend { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::State(StateError::LockContention { .. }) => Some(10),
            Self::State(StateError::Backend { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this error rejected the plan before any apply began.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Graph(_))
    }

    /// Maps the error onto a session exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::State(StateError::LockContention { .. } | StateError::StaleWrite { .. }) => {
                EXIT_LOCK_CONTENTION
            }
            _ => EXIT_PLAN_REJECTED,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl GraphError {
    /// Creates an unresolved reference error.
    #[must_use]
    pub fn unresolved(
        from: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnresolvedReference {
            from: from.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }
}

impl StateError {
    /// Creates a backend storage error.
    #[must_use]
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ResourceApplyError {
    /// Creates an error that may succeed when retried (timeouts, transient provider failures).
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an error that will not succeed without changing the input
    /// (validation, permission).
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = GraphError::CycleDetected {
            cycle: vec!["net/a".into(), "net/b".into(), "net/a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: net/a -> net/b -> net/a");
    }

    #[test]
    fn test_exit_codes() {
        let cycle = TerrastackError::from(GraphError::CycleDetected { cycle: vec![] });
        assert_eq!(cycle.exit_code(), EXIT_PLAN_REJECTED);
        assert!(cycle.is_structural());

        let contention = TerrastackError::from(StateError::LockContention {
            key: "app/dev".into(),
            holder: "other".into(),
            since: String::new(),
            expires_at: String::new(),
        });
        assert_eq!(contention.exit_code(), EXIT_LOCK_CONTENTION);
        assert!(contention.is_retryable());
        assert_eq!(contention.retry_delay_secs(), Some(10));

        let stale = TerrastackError::from(StateError::StaleWrite {
            key: "app/dev".into(),
            token: "t".into(),
        });
        assert_eq!(stale.exit_code(), EXIT_LOCK_CONTENTION);
        assert!(!stale.is_retryable());
    }

    #[test]
    fn test_resource_apply_error_classification() {
        assert!(ResourceApplyError::retryable("timed out").retryable);
        assert!(!ResourceApplyError::permanent("access denied").retryable);
    }
}
