//! Execs backed by a process in a container engine container.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use isoshim_common::constants::UNKNOWN_EXIT_STATUS;
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{ExecState, ExecStatus, StdioConfig, TaskId};
use parking_lot::Mutex;

use super::{Exec, ExecLifecycle, invalid_state};
use crate::backend::{Boundary, ContainerHandle, ContainerProcess, HandleError, ProcessConfig};
use crate::spec::ProcessSpec;

/// An exec whose process runs inside a container.
///
/// The init exec (empty id) also starts the container itself. Once the
/// process is running, a background watcher records its exit and releases
/// the process handle.
pub struct ContainerExec {
    id: String,
    task_id: TaskId,
    bundle: PathBuf,
    process_spec: ProcessSpec,
    stdio: StdioConfig,
    container: Arc<dyn ContainerHandle>,
    // Keeps the hosting boundary referenced for as long as the exec lives.
    _boundary: Option<Arc<dyn Boundary>>,
    lifecycle: Arc<ExecLifecycle>,
    process: Mutex<Option<Arc<dyn ContainerProcess>>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ContainerExec {
    /// Creates an exec in the `Created` state.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        id: impl Into<String>,
        bundle: PathBuf,
        process_spec: ProcessSpec,
        stdio: StdioConfig,
        container: Arc<dyn ContainerHandle>,
        boundary: Option<Arc<dyn Boundary>>,
    ) -> Self {
        Self {
            id: id.into(),
            task_id,
            bundle,
            process_spec,
            stdio,
            container,
            _boundary: boundary,
            lifecycle: Arc::new(ExecLifecycle::new()),
            process: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Bundle directory of the owning task.
    #[must_use]
    pub const fn bundle(&self) -> &PathBuf {
        &self.bundle
    }

    fn is_init(&self) -> bool {
        self.id.is_empty()
    }

    fn running_process(&self, op: &str) -> Result<Arc<dyn ContainerProcess>> {
        let state = self.lifecycle.state();
        if state != ExecState::Running {
            return Err(invalid_state(&self.task_id, &self.id, state, op));
        }
        self.process
            .lock()
            .clone()
            .ok_or_else(|| invalid_state(&self.task_id, &self.id, state, op))
    }

    async fn launch(&self) -> std::result::Result<Arc<dyn ContainerProcess>, HandleError> {
        if self.is_init() {
            self.container.start().await?;
        }
        let config = ProcessConfig {
            exec_id: self.id.clone(),
            bundle: self.bundle.clone(),
            process: self.process_spec.clone(),
            stdio: self.stdio.clone(),
        };
        self.container.create_process(&config).await
    }

    fn watch_exit(&self, process: Arc<dyn ContainerProcess>) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let tid = self.task_id.clone();
        let eid = self.id.clone();
        drop(tokio::spawn(async move {
            let exit_status = match process.wait().await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(%tid, %eid, error = %e, "failed to wait for process exit");
                    UNKNOWN_EXIT_STATUS
                }
            };
            let _ = lifecycle.mark_exited(exit_status);
            tracing::debug!(%tid, %eid, exit_status, "exec exited");

            if let Err(e) = process.close().await {
                if !e.is_already_closed() {
                    tracing::warn!(%tid, %eid, error = %e, "failed to release process handle");
                }
            }
        }));
    }
}

#[async_trait]
impl Exec for ContainerExec {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn pid(&self) -> u32 {
        self.lifecycle.status().pid
    }

    fn state(&self) -> ExecState {
        self.lifecycle.state()
    }

    fn status(&self) -> ExecStatus {
        self.lifecycle.status()
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        let state = self.lifecycle.state();
        if state != ExecState::Created {
            return Err(invalid_state(&self.task_id, &self.id, state, "start"));
        }

        let process = match self.launch().await {
            Ok(p) => p,
            Err(e) => {
                // Nothing will ever run; release anyone already waiting.
                let _ = self.lifecycle.mark_exited(UNKNOWN_EXIT_STATUS);
                return Err(e.into_shim("start exec"));
            }
        };

        let pid = process.pid();
        *self.process.lock() = Some(Arc::clone(&process));
        self.lifecycle
            .mark_running(pid)
            .map_err(|s| invalid_state(&self.task_id, &self.id, s, "start"))?;
        tracing::info!(tid = %self.task_id, eid = %self.id, pid, "exec started");

        self.watch_exit(process);
        Ok(())
    }

    async fn kill(&self, signal: u32) -> Result<()> {
        let process = self.running_process("kill")?;
        match process.signal(signal).await {
            Ok(()) | Err(HandleError::AlreadyStopped) => Ok(()),
            Err(e) => Err(e.into_shim("signal process")),
        }
    }

    async fn wait(&self) -> ExecStatus {
        self.lifecycle.wait().await
    }

    async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        if !self.stdio.terminal {
            return Err(ShimError::precondition(format!(
                "exec '{}' in task '{}' has no terminal",
                self.id, self.task_id
            )));
        }
        let process = self.running_process("resize_pty")?;
        process
            .resize_console(width, height)
            .await
            .map_err(|e| e.into_shim("resize console"))
    }

    async fn close_io(&self, stdin: bool) -> Result<()> {
        if !stdin {
            return Ok(());
        }
        let process = self.running_process("close_io")?;
        process
            .close_stdin()
            .await
            .map_err(|e| e.into_shim("close stdin"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, FakeContainer};

    fn exec(id: &str, container: Arc<FakeContainer>, terminal: bool) -> ContainerExec {
        ContainerExec::new(
            TaskId::new("t1"),
            id,
            PathBuf::from("/bundle"),
            ProcessSpec::default(),
            StdioConfig {
                terminal,
                ..StdioConfig::default()
            },
            container,
            None,
        )
    }

    #[tokio::test]
    async fn init_start_starts_container_then_process() {
        let log = CallLog::default();
        let container = Arc::new(FakeContainer::new(log.clone()).with_first_pid(100));
        let init = exec("", Arc::clone(&container), false);

        init.start().await.unwrap();
        assert_eq!(init.state(), ExecState::Running);
        assert_eq!(init.pid(), 100);
        assert_eq!(log.entries(), ["container.start", "container.create_process()"]);
    }

    #[tokio::test]
    async fn additional_exec_does_not_start_container() {
        let log = CallLog::default();
        let container = Arc::new(FakeContainer::new(log.clone()));
        let e1 = exec("e1", container, false);

        e1.start().await.unwrap();
        assert_eq!(log.entries(), ["container.create_process(e1)"]);
    }

    #[tokio::test]
    async fn start_twice_is_failed_precondition() {
        let container = Arc::new(FakeContainer::new(CallLog::default()));
        let e1 = exec("e1", container, false);
        e1.start().await.unwrap();
        assert!(e1.start().await.unwrap_err().is_failed_precondition());
    }

    #[tokio::test]
    async fn kill_requires_running() {
        let container = Arc::new(FakeContainer::new(CallLog::default()));
        let e1 = exec("e1", container, false);
        assert!(e1.kill(15).await.unwrap_err().is_failed_precondition());
    }

    #[tokio::test]
    async fn kill_drives_exit_through_the_watcher() {
        let container = Arc::new(FakeContainer::new(CallLog::default()).with_first_pid(200));
        let e1 = exec("e1", container, false);
        e1.start().await.unwrap();

        e1.kill(9).await.unwrap();
        let status = e1.wait().await;
        assert_eq!(e1.state(), ExecState::Exited);
        assert_eq!(status.pid, 200);
        assert_eq!(status.exit_status, 128 + 9);
        assert!(status.exited_at.is_some());
        assert!(e1.kill(9).await.unwrap_err().is_failed_precondition());
    }

    #[tokio::test]
    async fn failed_launch_exits_from_created() {
        let container = Arc::new(FakeContainer::new(CallLog::default()).failing_process_creation());
        let e1 = exec("e1", container, false);

        assert!(e1.start().await.is_err());
        assert_eq!(e1.state(), ExecState::Exited);
        assert_eq!(e1.wait().await.exit_status, UNKNOWN_EXIT_STATUS);
    }

    #[tokio::test]
    async fn resize_requires_terminal() {
        let container = Arc::new(FakeContainer::new(CallLog::default()));
        let plain = exec("e1", Arc::clone(&container), false);
        plain.start().await.unwrap();
        assert!(plain.resize_pty(80, 24).await.unwrap_err().is_failed_precondition());

        let tty = exec("e2", container, true);
        tty.start().await.unwrap();
        tty.resize_pty(80, 24).await.unwrap();
        tty.close_io(true).await.unwrap();
    }
}
