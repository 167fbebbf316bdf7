//! Execs: the processes tracked under a task.
//!
//! Every exec runs the same state machine, `Created -> Running -> Exited`,
//! held in an [`ExecLifecycle`]. Concrete execs only decide how a process
//! is started and signaled.

pub mod container;

use async_trait::async_trait;
use chrono::Utc;
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{ExecState, ExecStatus, TaskId};
use parking_lot::Mutex;
use tokio::sync::watch;

pub use container::ContainerExec;

/// One process tracked under a task.
///
/// The init exec has an empty id. All other ids are non-empty and unique
/// within their task.
#[async_trait]
pub trait Exec: Send + Sync {
    /// Exec identifier.
    fn id(&self) -> &str;

    /// Identifier of the owning task.
    fn task_id(&self) -> &TaskId;

    /// OS process identifier, zero until started.
    fn pid(&self) -> u32;

    /// Current lifecycle state.
    fn state(&self) -> ExecState;

    /// Current status; exit fields are final once [`ExecState::Exited`].
    fn status(&self) -> ExecStatus;

    /// Starts the process, moving `Created -> Running`.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition if the exec is not `Created`, or the
    /// backend error if the process cannot be launched.
    async fn start(&self) -> Result<()>;

    /// Delivers `signal`. The exit is observed later, asynchronously.
    ///
    /// # Errors
    ///
    /// Returns a failed precondition if the exec is not `Running`.
    async fn kill(&self, signal: u32) -> Result<()>;

    /// Waits until the exec has exited and returns its final status.
    async fn wait(&self) -> ExecStatus;

    /// Resizes the exec's terminal.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::Unimplemented`] unless the exec supports it.
    async fn resize_pty(&self, _width: u32, _height: u32) -> Result<()> {
        Err(ShimError::Unimplemented {
            operation: "resize_pty",
        })
    }

    /// Closes the exec's standard input.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::Unimplemented`] unless the exec supports it.
    async fn close_io(&self, _stdin: bool) -> Result<()> {
        Err(ShimError::Unimplemented {
            operation: "close_io",
        })
    }
}

/// Builds the failed precondition for an operation in the wrong state.
pub fn invalid_state(task_id: &TaskId, exec_id: &str, state: ExecState, op: &str) -> ShimError {
    ShimError::precondition(format!(
        "exec '{exec_id}' in task '{task_id}' is in invalid state '{state}' for {op}"
    ))
}

#[derive(Debug)]
struct LifecycleInner {
    state: ExecState,
    status: ExecStatus,
}

/// The shared exec state machine.
///
/// Exit is published through a watch channel so any number of waiters are
/// released together and all read the same captured status.
#[derive(Debug)]
pub struct ExecLifecycle {
    inner: Mutex<LifecycleInner>,
    exited: watch::Sender<bool>,
}

impl Default for ExecLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecLifecycle {
    /// Creates a lifecycle in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            inner: Mutex::new(LifecycleInner {
                state: ExecState::Created,
                status: ExecStatus::pending(0),
            }),
            exited,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExecState {
        self.inner.lock().state
    }

    /// Current status.
    pub fn status(&self) -> ExecStatus {
        self.inner.lock().status
    }

    /// Moves `Created -> Running` with the launched process id.
    ///
    /// Returns the state found instead when it was not `Created`.
    ///
    /// # Errors
    ///
    /// Returns the current state if the transition is not allowed.
    pub fn mark_running(&self, pid: u32) -> std::result::Result<(), ExecState> {
        let mut inner = self.inner.lock();
        if inner.state != ExecState::Created {
            return Err(inner.state);
        }
        inner.state = ExecState::Running;
        inner.status.pid = pid;
        Ok(())
    }

    /// Moves to `Exited`, capturing the exit status and time together.
    ///
    /// Returns `false` if the exec had already exited; the first captured
    /// status is kept.
    pub fn mark_exited(&self, exit_status: u32) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ExecState::Exited {
                return false;
            }
            inner.state = ExecState::Exited;
            inner.status.exit_status = exit_status;
            inner.status.exited_at = Some(Utc::now());
        }
        let _ = self.exited.send_replace(true);
        true
    }

    /// Waits for `Exited` and returns the captured status.
    pub async fn wait(&self) -> ExecStatus {
        let mut rx = self.exited.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|exited| *exited).await;
        self.status()
    }
}
