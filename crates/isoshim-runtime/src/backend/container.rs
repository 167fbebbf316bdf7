//! Container engine handles, processes, and attached host resources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use isoshim_common::types::{StdioConfig, TaskId};

use super::{Boundary, HandleError};
use crate::spec::{ProcessSpec, RuntimeSpec};

/// Everything the engine needs to create a container.
#[derive(Clone)]
pub struct ContainerCreateOptions {
    /// Container identifier, equal to the task id.
    pub id: TaskId,
    /// Owner recorded against the container.
    pub owner: String,
    /// Runtime specification of the container.
    pub spec: RuntimeSpec,
    /// Network namespace to join, if any.
    pub network_namespace: Option<String>,
    /// Boundary hosting the container; `None` places it on the host.
    pub boundary: Option<Arc<dyn Boundary>>,
}

impl std::fmt::Debug for ContainerCreateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerCreateOptions")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("network_namespace", &self.network_namespace)
            .field("boundary", &self.boundary.as_ref().map(|b| b.id().to_owned()))
            .finish_non_exhaustive()
    }
}

/// Configuration of one process launched in a container.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Exec identifier, empty for the init process.
    pub exec_id: String,
    /// Bundle directory of the task.
    pub bundle: PathBuf,
    /// Process arguments, environment, and working directory.
    pub process: ProcessSpec,
    /// Standard stream addresses.
    pub stdio: StdioConfig,
}

impl ProcessConfig {
    /// Returns `true` for the container's init process.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.exec_id.is_empty()
    }
}

/// A process running inside a container.
#[async_trait]
pub trait ContainerProcess: Send + Sync {
    /// OS process identifier.
    fn pid(&self) -> u32;

    /// Delivers `signal` to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    async fn signal(&self, signal: u32) -> Result<(), HandleError>;

    /// Waits for the process to exit and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the exit could not be observed.
    async fn wait(&self) -> Result<u32, HandleError>;

    /// Resizes the process console.
    ///
    /// # Errors
    ///
    /// Returns an error if the console cannot be resized.
    async fn resize_console(&self, width: u32, height: u32) -> Result<(), HandleError>;

    /// Closes the process standard input.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin cannot be closed.
    async fn close_stdin(&self) -> Result<(), HandleError>;

    /// Releases the process handle and its stream relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be released.
    async fn close(&self) -> Result<(), HandleError>;
}

/// Handle to one container owned by the container engine.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Starts the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start(&self) -> Result<(), HandleError>;

    /// Launches a process inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be created.
    async fn create_process(
        &self,
        config: &ProcessConfig,
    ) -> Result<Arc<dyn ContainerProcess>, HandleError>;

    /// Requests a graceful shutdown. May report [`HandleError::Pending`].
    ///
    /// # Errors
    ///
    /// Returns an error or a pending condition.
    async fn shutdown(&self) -> Result<(), HandleError>;

    /// Forces the container to stop. May report [`HandleError::Pending`]
    /// or [`HandleError::AlreadyStopped`].
    ///
    /// # Errors
    ///
    /// Returns an error or a stop condition.
    async fn terminate(&self) -> Result<(), HandleError>;

    /// Waits up to `timeout` for a pending shutdown or terminate.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Timeout`] if the container is still stopping.
    async fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError>;

    /// Invalidates the handle. May report [`HandleError::AlreadyClosed`].
    ///
    /// # Errors
    ///
    /// Returns an error or the already-closed condition.
    async fn close(&self) -> Result<(), HandleError>;
}

/// Creates containers, optionally inside a boundary.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates a container and attaches its host resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    async fn create_container(
        &self,
        options: &ContainerCreateOptions,
    ) -> Result<(Arc<dyn ContainerHandle>, Resources), HandleError>;
}

/// Kind of a host resource attached to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// An image layer.
    Layer,
    /// A bind or volume mount.
    Mount,
    /// A device assigned to the container or its boundary.
    Device,
    /// A network endpoint.
    Network,
}

/// One host resource attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedResource {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Host-side path or identifier.
    pub host_path: String,
    /// Path inside the container or boundary, if mapped.
    pub guest_path: Option<String>,
}

/// Host resources held by one container. Released exactly once, by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// Attached resources in attach order.
    pub entries: Vec<AttachedResource>,
}

impl Resources {
    /// Returns `true` when nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Releases the host resources of a container.
#[async_trait]
pub trait ResourceReleaser: Send + Sync {
    /// Releases `resources`, detaching from `boundary` when present.
    ///
    /// With `force`, detach failures on individual entries do not stop the
    /// remaining entries from being released.
    ///
    /// # Errors
    ///
    /// Returns the first release failure.
    async fn release(
        &self,
        resources: Resources,
        boundary: Option<Arc<dyn Boundary>>,
        force: bool,
    ) -> Result<(), HandleError>;
}
