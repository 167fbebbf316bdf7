//! Operator-facing surface over the tasks of one shim.

use std::collections::HashMap;
use std::sync::Arc;

use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{ExecState, ExecStatus, PidPair, TaskId};
use parking_lot::RwLock;
use serde::Serialize;

use crate::exec::Exec;
use crate::task::{
    Collaborators, CreateExecRequest, CreateTaskRequest, Task, new_standalone_task,
};

/// Point-in-time view of one exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecInfo {
    /// Owning task.
    pub task_id: TaskId,
    /// Exec identifier, empty for the init exec.
    pub exec_id: String,
    /// Lifecycle state.
    pub state: ExecState,
    /// Status; exit fields are only meaningful once exited.
    pub status: ExecStatus,
}

/// Table of tasks plus the collaborators used to create them.
pub struct ShimService {
    deps: Collaborators,
    tasks: RwLock<HashMap<TaskId, Arc<dyn Task>>>,
    // Serializes whole creations so a slow create cannot race a duplicate.
    create_lock: tokio::sync::Mutex<()>,
}

impl ShimService {
    /// Creates a service with no tasks.
    pub fn new(deps: Collaborators) -> Self {
        Self {
            deps,
            tasks: RwLock::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a standalone task and tracks it.
    ///
    /// # Errors
    ///
    /// Returns already-exists for a tracked id, or the creation error.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<Arc<dyn Task>> {
        let _guard = self.create_lock.lock().await;
        let id = req.id.clone();
        if self.tasks.read().contains_key(&id) {
            return Err(ShimError::AlreadyExists {
                kind: "task",
                id: id.to_string(),
            });
        }
        let task: Arc<dyn Task> = new_standalone_task(&self.deps, req).await?;
        let _ = self.tasks.write().insert(id, Arc::clone(&task));
        Ok(task)
    }

    /// Tracks a task created elsewhere.
    ///
    /// # Errors
    ///
    /// Returns already-exists if the id is already tracked.
    pub fn add_task(&self, task: Arc<dyn Task>) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(task.id()) {
            return Err(ShimError::AlreadyExists {
                kind: "task",
                id: task.id().to_string(),
            });
        }
        let _ = tasks.insert(task.id().clone(), task);
        Ok(())
    }

    /// Returns a tracked task.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown id.
    pub fn task(&self, tid: &TaskId) -> Result<Arc<dyn Task>> {
        self.tasks
            .read()
            .get(tid)
            .cloned()
            .ok_or_else(|| ShimError::NotFound {
                kind: "task",
                id: tid.to_string(),
            })
    }

    /// Ids of every tracked task, sorted.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.read().keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Starts an exec and returns its pid.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec, or the start error.
    pub async fn start(&self, tid: &TaskId, eid: &str) -> Result<u32> {
        tracing::debug!(%tid, eid, "start");
        let exec = self.exec(tid, eid)?;
        exec.start().await?;
        Ok(exec.pid())
    }

    /// Creates an additional exec.
    ///
    /// # Errors
    ///
    /// See [`Task::create_exec`].
    pub fn create_exec(&self, tid: &TaskId, req: CreateExecRequest) -> Result<()> {
        self.task(tid)?.create_exec(req)
    }

    /// Signals one exec, or all of them.
    ///
    /// # Errors
    ///
    /// See [`Task::kill_exec`].
    pub async fn kill(&self, tid: &TaskId, eid: &str, signal: u32, all: bool) -> Result<()> {
        self.task(tid)?.kill_exec(eid, signal, all).await
    }

    /// Deletes an exited exec. Deleting the init exec forgets the task.
    ///
    /// # Errors
    ///
    /// See [`Task::delete_exec`].
    pub fn delete(&self, tid: &TaskId, eid: &str) -> Result<ExecStatus> {
        let task = self.task(tid)?;
        let status = task.delete_exec(eid)?;
        if eid.is_empty() {
            let _ = self.tasks.write().remove(tid);
            tracing::info!(%tid, "task deleted");
        }
        Ok(status)
    }

    /// Looks up an exec.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec.
    pub fn exec(&self, tid: &TaskId, eid: &str) -> Result<Arc<dyn Exec>> {
        self.task(tid)?.get_exec(eid)
    }

    /// Returns the current state and status of an exec.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec.
    pub fn state(&self, tid: &TaskId, eid: &str) -> Result<ExecInfo> {
        let exec = self.exec(tid, eid)?;
        Ok(ExecInfo {
            task_id: tid.clone(),
            exec_id: eid.to_owned(),
            state: exec.state(),
            status: exec.status(),
        })
    }

    /// Waits for an exec to exit and returns its final status.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec.
    pub async fn wait(&self, tid: &TaskId, eid: &str) -> Result<ExecStatus> {
        let exec = self.exec(tid, eid)?;
        Ok(exec.wait().await)
    }

    /// Lists every process of a task.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task.
    pub fn pids(&self, tid: &TaskId) -> Result<Vec<PidPair>> {
        self.task(tid)?.pids()
    }

    /// Resizes the terminal of an exec.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec, or the resize error.
    pub async fn resize_pty(
        &self,
        tid: &TaskId,
        eid: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.exec(tid, eid)?.resize_pty(width, height).await
    }

    /// Closes the standard input of an exec.
    ///
    /// # Errors
    ///
    /// Returns not-found for an unknown task or exec, or the close error.
    pub async fn close_io(&self, tid: &TaskId, eid: &str, stdin: bool) -> Result<()> {
        self.exec(tid, eid)?.close_io(stdin).await
    }
}
