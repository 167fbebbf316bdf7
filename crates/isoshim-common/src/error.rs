//! Unified error types for the isoshim workspace.
//!
//! The first four variants form the caller-visible taxonomy of every
//! operator call. The rest are ambient failures raised while reading
//! configuration, talking to a backend, or publishing events.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The operation is invalid in the current state. Nothing was mutated.
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Description of the violated precondition.
        message: String,
    },

    /// A referenced resource does not exist.
    #[error("{kind} not found: '{id}'")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: '{id}'")]
    AlreadyExists {
        /// Type of the duplicate resource.
        kind: &'static str,
        /// Identifier of the duplicate resource.
        id: String,
    },

    /// The operation is intentionally unsupported by this variant.
    #[error("not implemented: {operation}")]
    Unimplemented {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration or specification value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An external collaborator (boundary, container engine, releaser) failed.
    #[error("{operation} failed: {message}")]
    Backend {
        /// Backend operation that failed.
        operation: &'static str,
        /// Description reported by the backend.
        message: String,
    },

    /// An event could not be handed to the event transport.
    #[error("publish to {topic} failed: {message}")]
    Publish {
        /// Topic of the event.
        topic: String,
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ShimError {
    /// Builds a [`ShimError::FailedPrecondition`] from any message.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Returns `true` for [`ShimError::FailedPrecondition`].
    #[must_use]
    pub const fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition { .. })
    }

    /// Returns `true` for [`ShimError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for [`ShimError::AlreadyExists`].
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns `true` for [`ShimError::Unimplemented`].
    #[must_use]
    pub const fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented { .. })
    }

    /// Returns a short stable label (`snake_case`) for use in logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::FailedPrecondition { .. } => "failed_precondition",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Unimplemented { .. } => "unimplemented",
            Self::Io { .. } => "io",
            Self::Config { .. } => "config",
            Self::Backend { .. } => "backend",
            Self::Publish { .. } => "publish",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = ShimError> = std::result::Result<T, E>;
