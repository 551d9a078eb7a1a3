//! Error types for kubelift operations
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant includes contextual information like cluster and machine
//! names, the failed operation, and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for kubelift operations
#[derive(Debug, Error)]
pub enum Error {
    /// A resource (VM, load balancer, target, file) is absent.
    ///
    /// Idempotent ensure/delete paths treat this as success.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource
        resource: String,
    },

    /// Validation error for cluster/machine configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nat.lvs.publicIPAddr")
        field: Option<String>,
    },

    /// Infrastructure provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider type (vm, lvs, elb)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A remote command exited non-zero
    #[error("remote command failed on {target} (exit {status}): {command}")]
    RemoteCommand {
        /// The command that was run
        command: String,
        /// The host the command was run on
        target: String,
        /// Exit status of the command
        status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Local filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// Context where the error occurred (e.g., "ssh-config", "kubeconfig")
        context: String,
        /// The underlying io error
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The operation was cancelled.
    ///
    /// Always propagated verbatim so callers can distinguish cancellation
    /// from failure.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a not-found error for the given resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error with the given message
    ///
    /// For simple provider errors without full context.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            cluster: UNKNOWN_CONTEXT.to_string(),
            provider: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., configuration error)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a remote-command error
    pub fn remote_command(
        command: impl Into<String>,
        target: impl Into<String>,
        status: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            command: command.into(),
            target: target.into(),
            status,
            stderr: stderr.into(),
        }
    }

    /// Create an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Check if this error represents an absent resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error represents cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a
    /// config fix). Cancellation is never retried. Provider errors carry
    /// their own retryability.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::RemoteCommand { .. } => false,
            Error::Io { .. } => false,
            Error::Serialization { .. } => false,
            Error::Cancelled => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}
