//! Tasks: one container and the execs running in it.

pub mod container;
pub mod execs;
pub mod standalone;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use isoshim_common::config::ShimConfig;
use isoshim_common::error::Result;
use isoshim_common::types::{ExecStatus, PidPair, RootfsMount, StdioConfig, TaskId};

pub use container::ContainerTask;
pub use execs::TaskExecs;
pub use standalone::{TaskPlan, new_standalone_task, plan_task};

use crate::backend::{BoundaryProvisioner, ContainerEngine, ResourceReleaser};
use crate::events::Publisher;
use crate::exec::Exec;
use crate::spec::{ProcessSpec, RuntimeSpec};

/// Request to create a task.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    /// Task (container) identifier.
    pub id: TaskId,
    /// Bundle directory.
    pub bundle: PathBuf,
    /// Root filesystem mounts.
    pub rootfs: Vec<RootfsMount>,
    /// Standard stream addresses of the init process.
    pub stdio: StdioConfig,
    /// Runtime specification.
    pub spec: RuntimeSpec,
}

/// Request to create an additional exec.
#[derive(Debug, Clone, Default)]
pub struct CreateExecRequest {
    /// Exec identifier; must be non-empty.
    pub exec_id: String,
    /// Standard stream addresses.
    pub stdio: StdioConfig,
    /// Process to run.
    pub process: ProcessSpec,
}

/// External collaborators shared by every task of a shim.
#[derive(Clone)]
pub struct Collaborators {
    /// Creates isolation boundaries.
    pub provisioner: Arc<dyn BoundaryProvisioner>,
    /// Creates containers.
    pub engine: Arc<dyn ContainerEngine>,
    /// Releases container host resources.
    pub releaser: Arc<dyn ResourceReleaser>,
    /// Emits lifecycle events.
    pub publisher: Arc<dyn Publisher>,
    /// Shim configuration.
    pub config: ShimConfig,
}

/// Operator-facing capabilities of a task.
#[async_trait]
pub trait Task: Send + Sync {
    /// Identifier given at creation.
    fn id(&self) -> &TaskId;

    /// Creates an additional exec while the init exec is running.
    ///
    /// # Errors
    ///
    /// Returns already-exists for an empty or duplicate id, and a failed
    /// precondition unless the init exec is running.
    fn create_exec(&self, req: CreateExecRequest) -> Result<()>;

    /// Returns the exec with id `eid`; the empty id names the init exec.
    ///
    /// # Errors
    ///
    /// Returns not-found if no such exec exists.
    fn get_exec(&self, eid: &str) -> Result<Arc<dyn Exec>>;

    /// Signals one exec, or every exec when `all` is set.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition for `all` with a non-empty id, for the
    /// init exec while others are still live, or for a non-running target.
    async fn kill_exec(&self, eid: &str, signal: u32, all: bool) -> Result<()>;

    /// Deletes an exited exec and returns its final status.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition unless the exec has exited and, for the
    /// init exec, every other exec has exited too.
    fn delete_exec(&self, eid: &str) -> Result<ExecStatus>;

    /// Returns every tracked process, init first.
    ///
    /// # Errors
    ///
    /// Returns unimplemented if the task variant cannot enumerate processes.
    fn pids(&self) -> Result<Vec<PidPair>>;
}
