//! Tasks backed by a container engine container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use isoshim_common::error::Result;
use isoshim_common::types::{ExecStatus, IsolationKind, PidPair, TaskId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{Collaborators, CreateExecRequest, CreateTaskRequest, Task, TaskExecs};
use crate::backend::{Boundary, ContainerHandle, Resources};
use crate::events::{TaskCreateEvent, TaskEvent};
use crate::exec::{ContainerExec, Exec};
use crate::teardown::TeardownSequencer;

/// What task creation produced before the task itself is assembled.
pub struct ContainerParts {
    /// How the container is isolated.
    pub isolation: IsolationKind,
    /// Handle of the created container.
    pub container: Arc<dyn ContainerHandle>,
    /// Host resources attached to the container.
    pub resources: Resources,
    /// Boundary hosting the container, if any.
    pub boundary: Option<Arc<dyn Boundary>>,
    /// Whether the task closes `boundary` during teardown.
    pub owns_boundary: bool,
}

/// A task tracking one container, its init exec, and additional execs.
///
/// The container and its resources are only ever shut down by the task's
/// teardown flow, which starts once the init exec exits.
pub struct ContainerTask {
    id: TaskId,
    isolation: IsolationKind,
    bundle: PathBuf,
    container: Arc<dyn ContainerHandle>,
    boundary: Option<Arc<dyn Boundary>>,
    owns_boundary: bool,
    execs: TaskExecs,
    teardown: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerTask {
    /// Assembles the task around an already created container.
    ///
    /// Builds the init exec, spawns the teardown flow, and publishes the
    /// task-create event. A failed publication is logged only: from here on
    /// the teardown flow owns the container and boundary.
    pub fn assemble(
        deps: &Collaborators,
        req: CreateTaskRequest,
        parts: ContainerParts,
    ) -> Arc<Self> {
        let CreateTaskRequest {
            id,
            bundle,
            rootfs,
            stdio,
            spec,
        } = req;

        let init: Arc<dyn Exec> = Arc::new(ContainerExec::new(
            id.clone(),
            String::new(),
            bundle.clone(),
            spec.process.unwrap_or_default(),
            stdio.clone(),
            Arc::clone(&parts.container),
            parts.boundary.clone(),
        ));

        let teardown = TeardownSequencer::new(
            id.clone(),
            Arc::clone(&parts.container),
            parts.resources,
            Arc::clone(&deps.releaser),
            parts.boundary.clone(),
            parts.owns_boundary,
            &deps.config,
        )
        .spawn(Arc::clone(&init));

        let event = TaskEvent::Create(TaskCreateEvent {
            container_id: id.to_string(),
            bundle: bundle.clone(),
            rootfs,
            io: stdio,
            pid: init.pid(),
        });

        let task = Arc::new(Self {
            execs: TaskExecs::new(id.clone(), init, Arc::clone(&deps.publisher)),
            id,
            isolation: parts.isolation,
            bundle,
            container: parts.container,
            boundary: parts.boundary,
            owns_boundary: parts.owns_boundary,
            teardown: Mutex::new(Some(teardown)),
        });

        if let Err(e) = deps.publisher.publish(event) {
            tracing::warn!(tid = %task.id, error = %e, "failed to publish task create event");
        }
        tracing::info!(tid = %task.id, isolation = %task.isolation, "task created");
        task
    }

    /// How the container is isolated.
    pub const fn isolation(&self) -> IsolationKind {
        self.isolation
    }

    /// Bundle directory the task was created from.
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Boundary hosting the container, if any.
    pub const fn boundary(&self) -> Option<&Arc<dyn Boundary>> {
        self.boundary.as_ref()
    }

    /// Whether the task closes its boundary during teardown.
    pub const fn owns_boundary(&self) -> bool {
        self.owns_boundary
    }

    /// The init exec.
    pub const fn init(&self) -> &Arc<dyn Exec> {
        self.execs.init()
    }

    /// Waits until the teardown flow has finished.
    ///
    /// Only the first caller actually waits; later calls return at once.
    pub async fn wait_for_teardown(&self) {
        let handle = self.teardown.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(tid = %self.id, error = %e, "teardown flow aborted");
            }
        }
    }
}

#[async_trait]
impl Task for ContainerTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn create_exec(&self, req: CreateExecRequest) -> Result<()> {
        let CreateExecRequest {
            exec_id,
            stdio,
            process,
        } = req;
        self.execs.create_exec(&exec_id, || {
            Arc::new(ContainerExec::new(
                self.id.clone(),
                exec_id.clone(),
                self.bundle.clone(),
                process,
                stdio,
                Arc::clone(&self.container),
                self.boundary.clone(),
            ))
        })
    }

    fn get_exec(&self, eid: &str) -> Result<Arc<dyn Exec>> {
        self.execs.get_exec(eid)
    }

    async fn kill_exec(&self, eid: &str, signal: u32, all: bool) -> Result<()> {
        self.execs.kill_exec(eid, signal, all).await
    }

    fn delete_exec(&self, eid: &str) -> Result<ExecStatus> {
        self.execs.delete_exec(eid)
    }

    fn pids(&self) -> Result<Vec<PidPair>> {
        Ok(self.execs.pids())
    }
}
