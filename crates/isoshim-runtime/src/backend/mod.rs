//! Seams to the external collaborators a task drives.
//!
//! Implementors handle the platform-specific details of provisioning an
//! isolation boundary, creating containers and processes inside it, and
//! releasing the host resources attached to a container. The lifecycle
//! protocol in [`crate::task`] only ever talks to these traits.

pub mod boundary;
pub mod container;

use std::time::Duration;

use isoshim_common::error::ShimError;
use thiserror::Error;

pub use boundary::{
    Boundary, BoundaryOptions, BoundaryProvisioner, LinuxBoundaryOptions, WindowsBoundaryOptions,
};
pub use container::{
    AttachedResource, ContainerCreateOptions, ContainerEngine, ContainerHandle, ContainerProcess,
    ProcessConfig, ResourceKind, ResourceReleaser, Resources,
};

/// Conditions reported by boundary, container, and process handles.
///
/// `Pending`, `AlreadyStopped`, and `AlreadyClosed` are not failures on
/// their own. Callers decide per operation whether to wait or to treat them
/// as success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The operation was accepted but has not completed yet.
    #[error("operation pending completion")]
    Pending,
    /// The target was already stopped.
    #[error("already stopped")]
    AlreadyStopped,
    /// The handle was already closed.
    #[error("handle already closed")]
    AlreadyClosed,
    /// A bounded wait elapsed before completion.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Any other failure.
    #[error("{operation}: {message}")]
    Failed {
        /// Operation that failed.
        operation: &'static str,
        /// Failure description.
        message: String,
    },
}

impl HandleError {
    /// Builds a [`HandleError::Failed`].
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            message: message.into(),
        }
    }

    /// Returns `true` for [`HandleError::Pending`].
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` for [`HandleError::AlreadyStopped`].
    #[must_use]
    pub const fn is_already_stopped(&self) -> bool {
        matches!(self, Self::AlreadyStopped)
    }

    /// Returns `true` for [`HandleError::AlreadyClosed`].
    #[must_use]
    pub const fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }

    /// Converts into a workspace error attributed to `operation`.
    #[must_use]
    pub fn into_shim(self, operation: &'static str) -> ShimError {
        ShimError::Backend {
            operation,
            message: self.to_string(),
        }
    }
}

impl From<HandleError> for ShimError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::Failed { operation, message } => Self::Backend { operation, message },
            other => other.into_shim("backend"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_predicates() {
        assert!(HandleError::Pending.is_pending());
        assert!(HandleError::AlreadyStopped.is_already_stopped());
        assert!(HandleError::AlreadyClosed.is_already_closed());
        assert!(!HandleError::Timeout(Duration::from_secs(1)).is_pending());
    }

    #[test]
    fn failed_converts_keeping_operation() {
        let err: ShimError = HandleError::failed("create container", "no such layer").into();
        match err {
            ShimError::Backend { operation, message } => {
                assert_eq!(operation, "create container");
                assert_eq!(message, "no such layer");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
