//! Error types for the reconciliation engine.
//!
//! The hierarchy follows the run phases: configuration, graph construction,
//! planning, provider calls, state persistence and execution. Validation
//! errors (`Graph`, `Plan`) always fail a run before any provider call;
//! provider errors are attached to a single action and never abort
//! independent branches.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the deployment engine.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

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

    /// Environment variable is missing or malformed.
    #[error("Invalid environment variable {name}: {message}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Errors raised while building the resource graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two declared resources share a name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A reference points at a resource that is not declared.
    #[error("Resource '{resource}' references undeclared resource '{target}'")]
    DanglingReference {
        /// The referencing resource.
        resource: String,
        /// The missing target.
        target: String,
    },

    /// The references form a cycle.
    #[error("Reference cycle detected: {}", cycle.join(" -> "))]
    Cycle {
        /// Members of the cycle, in traversal order.
        cycle: Vec<String>,
    },

    /// A property bag does not match its kind's schema.
    #[error("Invalid property '{property}' on {kind} '{resource}': {message}")]
    Schema {
        /// Resource name.
        resource: String,
        /// Resource kind.
        kind: String,
        /// Offending property.
        property: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A stack output does not name an output of a declared resource.
    #[error("Invalid stack output '{output}': {message}")]
    Output {
        /// Output name.
        output: String,
        /// Description of the problem.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A replacement would orphan a dependent that cannot tolerate it.
    #[error(
        "Replacing '{resource}' conflicts with dependent '{dependent}': {dependent_kind} resources cannot outlive a replaced dependency"
    )]
    Conflict {
        /// The resource being replaced.
        resource: String,
        /// The dependent that would be orphaned.
        dependent: String,
        /// Kind of the dependent.
        dependent_kind: String,
    },

    /// No provider is registered for a resource kind.
    #[error("No provider registered for resource kind '{kind}'")]
    MissingProvider {
        /// The kind without a provider.
        kind: String,
    },
}

/// Errors returned by providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote operation failed.
    #[error("{operation} of '{resource}' failed: {message}")]
    Operation {
        /// Operation name (create, update, delete).
        operation: String,
        /// Logical resource name or provider id.
        resource: String,
        /// Message from the remote side.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Remote object not found: {provider_id}")]
    NotFound {
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// A reference could not be substituted before the call.
    #[error("Unresolved reference {reference} in '{resource}'")]
    UnresolvedReference {
        /// The resource whose properties were being resolved.
        resource: String,
        /// The reference text.
        reference: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted and cannot be parsed.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Local filesystem error.
    #[error("State file error: {message}")]
    Io {
        /// Description of the filesystem error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// The state writer task stopped accepting mutations.
    #[error("State writer is closed")]
    WriterClosed,
}

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Execution was aborted.
    #[error("Execution aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error was raised before any provider call and
    /// can be fixed by editing the declarations.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
    }

    /// Returns true if the recorded state could not be trusted.
    #[must_use]
    pub const fn is_state_corruption(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. })
        )
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
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a filesystem error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
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

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn operation(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Operation {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = GraphError::Cycle {
            cycle: vec![String::from("a"), String::from("b"), String::from("a")],
        };
        assert_eq!(err.to_string(), "Reference cycle detected: a -> b -> a");
    }

    #[test]
    fn test_classification() {
        let graph: DeployError = GraphError::DuplicateName {
            name: String::from("vm"),
        }
        .into();
        assert!(graph.is_validation());
        assert!(!graph.is_state_corruption());

        let corrupted: DeployError = StateError::corrupted("bad json").into();
        assert!(corrupted.is_state_corruption());
        assert!(!corrupted.is_validation());
    }
}
