//! The exec protocol shared by every task variant.
//!
//! [`TaskExecs`] owns the init exec, the registry of additional execs, and
//! the creation lock. All state rules of create, kill, and delete live here
//! and only depend on the [`Exec`] trait.

use std::sync::Arc;

use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{ExecState, ExecStatus, PidPair, TaskId};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::events::{ExecAddedEvent, Publisher, TaskDeleteEvent, TaskEvent};
use crate::exec::{Exec, invalid_state};
use crate::registry::ExecRegistry;

/// Init exec, additional execs, and the rules that govern them.
pub struct TaskExecs {
    task_id: TaskId,
    init: Arc<dyn Exec>,
    registry: ExecRegistry,
    // Serializes registry mutations of `create_exec` and `delete_exec`,
    // including their event publication and rollback.
    create_lock: Mutex<()>,
    publisher: Arc<dyn Publisher>,
}

impl TaskExecs {
    /// Creates the exec set of a task around its init exec.
    pub fn new(task_id: TaskId, init: Arc<dyn Exec>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            task_id,
            init,
            registry: ExecRegistry::new(),
            create_lock: Mutex::new(()),
            publisher,
        }
    }

    /// The init exec.
    pub const fn init(&self) -> &Arc<dyn Exec> {
        &self.init
    }

    /// The registry of additional execs.
    pub const fn registry(&self) -> &ExecRegistry {
        &self.registry
    }

    /// Creates an additional exec with `build` and registers it.
    ///
    /// `build` only runs once every check has passed. The exec is inserted
    /// before the exec-added event is published, so a consumer of the event
    /// can resolve it. Until publication returns, lookups already see the
    /// new exec; a failed publication removes it again.
    ///
    /// # Errors
    ///
    /// Returns already-exists for an empty or duplicate id, a failed
    /// precondition unless the init exec is running, or the publish error.
    pub fn create_exec<F>(&self, eid: &str, build: F) -> Result<()>
    where
        F: FnOnce() -> Arc<dyn Exec>,
    {
        tracing::debug!(tid = %self.task_id, eid, "create exec");
        let _guard = self.create_lock.lock();

        if eid.is_empty() || self.registry.contains(eid) {
            return Err(ShimError::AlreadyExists {
                kind: "exec",
                id: format!("{}/{eid}", self.task_id),
            });
        }
        let init_state = self.init.state();
        if init_state != ExecState::Running {
            return Err(ShimError::precondition(format!(
                "init exec of task '{}' must be running to create additional execs, is {init_state}",
                self.task_id
            )));
        }

        if !self.registry.insert(build()) {
            return Err(ShimError::AlreadyExists {
                kind: "exec",
                id: format!("{}/{eid}", self.task_id),
            });
        }
        let published = self.publisher.publish(TaskEvent::ExecAdded(ExecAddedEvent {
            container_id: self.task_id.to_string(),
            exec_id: eid.to_owned(),
        }));
        if let Err(e) = published {
            let _ = self.registry.remove(eid);
            return Err(e);
        }
        Ok(())
    }

    /// Returns the exec with id `eid`; the empty id names the init exec.
    ///
    /// # Errors
    ///
    /// Returns not-found if no such exec exists.
    pub fn get_exec(&self, eid: &str) -> Result<Arc<dyn Exec>> {
        if eid.is_empty() {
            return Ok(Arc::clone(&self.init));
        }
        self.registry.get(eid).ok_or_else(|| ShimError::NotFound {
            kind: "exec",
            id: format!("{}/{eid}", self.task_id),
        })
    }

    /// Signals one exec, or with `all` every live exec plus the init exec.
    ///
    /// Signals are dispatched concurrently; the call returns once every
    /// dispatch has finished, with the first error observed.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition for `all` with a non-empty id, for the
    /// init exec while additional execs are still live, or for a target
    /// that is not running.
    pub async fn kill_exec(&self, eid: &str, signal: u32, all: bool) -> Result<()> {
        tracing::debug!(tid = %self.task_id, eid, signal, all, "kill exec");
        if all && !eid.is_empty() {
            return Err(ShimError::precondition(format!(
                "cannot signal all for non-empty exec '{eid}'"
            )));
        }
        let target = self.get_exec(eid)?;

        let mut targets = Vec::new();
        if all {
            targets.extend(
                self.registry
                    .snapshot()
                    .into_iter()
                    .filter(|e| e.state() != ExecState::Exited),
            );
        } else if eid.is_empty() && !self.registry.all_exited() {
            return Err(ShimError::precondition(format!(
                "cannot signal init exec of task '{}' with un-exited additional execs",
                self.task_id
            )));
        }
        targets.push(target);

        let mut dispatches = JoinSet::new();
        for exec in targets {
            let _ = dispatches.spawn(async move { exec.kill(signal).await });
        }

        let mut first_err = None;
        while let Some(joined) = dispatches.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(ShimError::Backend {
                    operation: "signal exec",
                    message: e.to_string(),
                })
            });
            if let Err(e) = outcome {
                tracing::warn!(tid = %self.task_id, signal, error = %e, "signal dispatch failed");
                let _ = first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Deletes an exited exec and returns its final status.
    ///
    /// Deleting the init exec leaves the registry untouched; it stands for
    /// deleting the whole task.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition unless the exec has exited and, for the
    /// init exec, every additional exec has exited too. A failed publication
    /// restores the removed entry and is returned as is.
    pub fn delete_exec(&self, eid: &str) -> Result<ExecStatus> {
        tracing::debug!(tid = %self.task_id, eid, "delete exec");
        let _guard = self.create_lock.lock();
        let exec = self.get_exec(eid)?;
        if eid.is_empty() && !self.registry.all_exited() {
            return Err(ShimError::precondition(format!(
                "cannot delete init exec of task '{}' with un-exited additional execs",
                self.task_id
            )));
        }
        let state = exec.state();
        if state != ExecState::Exited {
            return Err(invalid_state(&self.task_id, eid, state, "delete"));
        }
        let status = exec.status();

        let removed = if eid.is_empty() {
            None
        } else {
            Some(self.registry.remove(eid).ok_or_else(|| ShimError::NotFound {
                kind: "exec",
                id: format!("{}/{eid}", self.task_id),
            })?)
        };

        let event = TaskEvent::Delete(TaskDeleteEvent {
            container_id: self.task_id.to_string(),
            exec_id: eid.to_owned(),
            pid: status.pid,
            exit_status: status.exit_status,
            exited_at: status.exited_at,
        });
        if let Err(e) = self.publisher.publish(event) {
            if let Some(removed) = removed {
                if !self.registry.insert(removed) {
                    tracing::error!(tid = %self.task_id, eid, "deleted exec could not be restored");
                }
            }
            return Err(e);
        }
        Ok(status)
    }

    /// Returns the init exec's pid pair followed by every registered exec.
    pub fn pids(&self) -> Vec<PidPair> {
        let execs = self.registry.snapshot();
        let mut pairs = Vec::with_capacity(execs.len() + 1);
        pairs.push(PidPair {
            pid: self.init.pid(),
            exec_id: self.init.id().to_owned(),
        });
        pairs.extend(execs.iter().map(|e| PidPair {
            pid: e.pid(),
            exec_id: e.id().to_owned(),
        }));
        pairs
    }
}
