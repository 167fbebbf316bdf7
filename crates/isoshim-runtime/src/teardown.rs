//! Container teardown after the init exec exits.
//!
//! Every stage is best effort: failures are logged and the sequence moves
//! on, because nothing is waiting on the background flow to hear about them.

use std::sync::Arc;
use std::time::Duration;

use isoshim_common::config::ShimConfig;
use isoshim_common::types::TaskId;
use tokio::task::JoinHandle;

use crate::backend::{Boundary, ContainerHandle, HandleError, ResourceReleaser, Resources};
use crate::exec::Exec;

/// Closes a container handle, treating an already closed handle as success.
///
/// Safe to call from several places at once; only the first close does any
/// work.
///
/// # Errors
///
/// Returns the handle error for any failure other than `AlreadyClosed`.
pub async fn close_container(container: &dyn ContainerHandle) -> Result<(), HandleError> {
    match container.close().await {
        Ok(()) | Err(HandleError::AlreadyClosed) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Stops a task's container and releases what it holds, in order.
pub struct TeardownSequencer {
    task_id: TaskId,
    container: Arc<dyn ContainerHandle>,
    resources: Resources,
    releaser: Arc<dyn ResourceReleaser>,
    boundary: Option<Arc<dyn Boundary>>,
    owns_boundary: bool,
    shutdown_timeout: Duration,
    terminate_timeout: Duration,
}

impl TeardownSequencer {
    /// Creates the sequencer for one task. Wait bounds come from `config`.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        container: Arc<dyn ContainerHandle>,
        resources: Resources,
        releaser: Arc<dyn ResourceReleaser>,
        boundary: Option<Arc<dyn Boundary>>,
        owns_boundary: bool,
        config: &ShimConfig,
    ) -> Self {
        Self {
            task_id,
            container,
            resources,
            releaser,
            boundary,
            owns_boundary,
            shutdown_timeout: config.shutdown_timeout(),
            terminate_timeout: config.terminate_timeout(),
        }
    }

    /// Spawns the background flow: wait for `init` to exit, then tear down.
    pub fn spawn(self, init: Arc<dyn Exec>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let status = init.wait().await;
            tracing::info!(
                tid = %self.task_id,
                pid = status.pid,
                exit_status = status.exit_status,
                "init exec exited, tearing down"
            );
            self.run().await;
        })
    }

    /// Runs every teardown stage once.
    pub async fn run(self) {
        let tid = self.task_id.clone();
        self.stop_container().await;

        if let Err(e) = self
            .releaser
            .release(self.resources, self.boundary.clone(), true)
            .await
        {
            tracing::error!(%tid, error = %e, "failed to release container resources");
        }

        if let Err(e) = close_container(self.container.as_ref()).await {
            tracing::error!(%tid, error = %e, "failed to close container");
        }

        if self.owns_boundary {
            if let Some(boundary) = &self.boundary {
                tracing::debug!(%tid, boundary = boundary.id(), "closing boundary");
                match boundary.close().await {
                    Ok(()) | Err(HandleError::AlreadyClosed) => {}
                    Err(e) => tracing::error!(%tid, error = %e, "failed to close boundary"),
                }
            }
        }
        tracing::debug!(%tid, "teardown complete");
    }

    async fn stop_container(&self) {
        let tid = &self.task_id;
        let needs_terminate = match self.container.shutdown().await {
            Ok(()) | Err(HandleError::AlreadyStopped) => false,
            Err(HandleError::Pending) => {
                match self.container.wait_timeout(self.shutdown_timeout).await {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::error!(%tid, error = %e, "failed to wait for container shutdown");
                        true
                    }
                }
            }
            Err(e) => {
                tracing::error!(%tid, error = %e, "failed to shut down container");
                true
            }
        };
        if !needs_terminate {
            return;
        }

        match self.container.terminate().await {
            Ok(()) | Err(HandleError::AlreadyStopped) => {}
            Err(HandleError::Pending) => {
                if let Err(e) = self.container.wait_timeout(self.terminate_timeout).await {
                    tracing::error!(%tid, error = %e, "failed to wait for container terminate");
                }
            }
            Err(e) => tracing::error!(%tid, error = %e, "failed to terminate container"),
        }
    }
}
