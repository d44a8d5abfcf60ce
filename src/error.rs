//! Error types for the bootstrap orchestrator

use std::time::Duration;

use thiserror::Error;

/// Failure modes reported by a cloud backend
///
/// Every variant is fatal to the branch of the cloud that produced it and
/// never to sibling branches.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The account ran out of capacity for the requested resources
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The region or location does not exist for this backend
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// The caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other rejection from the backend API
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed cluster spec, run configuration or graph definition
    #[error("validation error: {0}")]
    Validation(String),

    /// The dependency set of a resource graph contains a cycle
    #[error("cycle detected in resource graph: {0}")]
    CycleDetected(String),

    /// A cloud backend rejected an operation
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A bounded wait was exceeded
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// A package release failed to install or upgrade
    #[error("install of release {release} failed: {message}")]
    Install {
        /// Release name
        release: String,
        /// Installer output
        message: String,
    },

    /// A readiness condition was not reached in time
    #[error("workloads matching {selector} in {namespace} not ready after {after:?}")]
    VerificationTimeout {
        /// Namespace that was polled
        namespace: String,
        /// Label selector that was polled
        selector: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// A cluster handle could not be turned into a client context
    #[error("credential error: {0}")]
    Credential(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A collaborator process could not be run
    #[error("command {command} failed: {message}")]
    Command {
        /// The program that was invoked
        command: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The run was cancelled before the operation could start
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an install error for the given release
    pub fn install(release: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Install {
            release: release.into(),
            message: message.into(),
        }
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a command error for the given program
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors caught before any node executes
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::CycleDetected(_))
    }

    /// True for bounded waits that were exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::VerificationTimeout { .. })
    }

    /// Short category name used in run reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::CycleDetected(_) => "ValidationError",
            Self::Backend(_) => "BackendError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Install { .. } => "InstallError",
            Self::VerificationTimeout { .. } => "VerificationTimeout",
            Self::Credential(_) => "CredentialError",
            Self::Kube(_) => "KubeError",
            Self::Command { .. } => "CommandError",
            Self::Serialization(_) => "SerializationError",
            Self::Cancelled => "Cancelled",
        }
    }
}
