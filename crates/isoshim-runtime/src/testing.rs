//! In-memory execs, tasks, and collaborator fakes.
//!
//! Every fake records the calls it receives in a shared [`CallLog`] so tests
//! can assert on the order in which the lifecycle drives its collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use isoshim_common::constants::UNKNOWN_EXIT_STATUS;
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{ExecState, ExecStatus, PidPair, TaskId};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::backend::{
    AttachedResource, Boundary, BoundaryOptions, BoundaryProvisioner, ContainerCreateOptions,
    ContainerEngine, ContainerHandle, ContainerProcess, HandleError, LinuxBoundaryOptions,
    ProcessConfig, ResourceKind, ResourceReleaser, Resources, WindowsBoundaryOptions,
};
use crate::events::{Publisher, TaskEvent};
use crate::exec::{Exec, ExecLifecycle, invalid_state};
use crate::task::{CreateExecRequest, Task, TaskExecs};

/// Ordered record of calls made to the fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Appends one entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns every entry recorded so far.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// An exec whose transitions are driven directly by the test.
///
/// `start` moves it to `Running` and a successful `kill` to `Exited` with
/// status `128 + signal`, both synchronously.
pub struct TestExec {
    id: String,
    task_id: TaskId,
    pid: u32,
    lifecycle: ExecLifecycle,
    signals: Mutex<Vec<u32>>,
    kill_failure: Option<String>,
}

impl TestExec {
    /// Creates an exec in the `Created` state that reports `pid`.
    pub fn new(task_id: TaskId, id: impl Into<String>, pid: u32) -> Self {
        Self {
            id: id.into(),
            task_id,
            pid,
            lifecycle: ExecLifecycle::new(),
            signals: Mutex::new(Vec::new()),
            kill_failure: None,
        }
    }

    /// Makes every `kill` fail with a backend error carrying `message`.
    #[must_use]
    pub fn with_kill_failure(mut self, message: impl Into<String>) -> Self {
        self.kill_failure = Some(message.into());
        self
    }

    /// Moves the exec to `Running` if it is still `Created`.
    pub fn set_running(&self) {
        let _ = self.lifecycle.mark_running(self.pid);
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, exit_status: u32) {
        let _ = self.lifecycle.mark_exited(exit_status);
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<u32> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl Exec for TestExec {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> ExecState {
        self.lifecycle.state()
    }

    fn status(&self) -> ExecStatus {
        self.lifecycle.status()
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle
            .mark_running(self.pid)
            .map_err(|s| invalid_state(&self.task_id, &self.id, s, "start"))
    }

    async fn kill(&self, signal: u32) -> Result<()> {
        let state = self.lifecycle.state();
        if state != ExecState::Running {
            return Err(invalid_state(&self.task_id, &self.id, state, "kill"));
        }
        self.signals.lock().push(signal);
        if let Some(message) = &self.kill_failure {
            return Err(ShimError::Backend {
                operation: "signal process",
                message: message.clone(),
            });
        }
        let _ = self.lifecycle.mark_exited(128 + signal);
        Ok(())
    }

    async fn wait(&self) -> ExecStatus {
        self.lifecycle.wait().await
    }
}

/// A task made only of [`TestExec`]s, with no container behind it.
pub struct TestTask {
    id: TaskId,
    init: Arc<TestExec>,
    execs: TaskExecs,
    next_pid: AtomicU32,
}

impl TestTask {
    /// Creates a task whose init exec reports `init_pid`.
    ///
    /// Additional execs get consecutive pids after `init_pid`.
    pub fn new(id: TaskId, init_pid: u32, publisher: Arc<dyn Publisher>) -> Self {
        let init = Arc::new(TestExec::new(id.clone(), "", init_pid));
        let execs = TaskExecs::new(id.clone(), Arc::clone(&init) as Arc<dyn Exec>, publisher);
        Self {
            id,
            init,
            execs,
            next_pid: AtomicU32::new(init_pid + 1),
        }
    }

    /// The init exec.
    pub const fn init(&self) -> &Arc<TestExec> {
        &self.init
    }
}

#[async_trait]
impl Task for TestTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn create_exec(&self, req: CreateExecRequest) -> Result<()> {
        self.execs.create_exec(&req.exec_id, || {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            Arc::new(TestExec::new(self.id.clone(), req.exec_id.clone(), pid))
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

/// Publisher that keeps every event in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<TaskEvent>>,
    fail_next: AtomicBool,
}

impl RecordingPublisher {
    /// Makes the next publication fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    /// Topics of the events published so far.
    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(TaskEvent::topic).collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: TaskEvent) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ShimError::Publish {
                topic: event.topic().to_owned(),
                message: "injected failure".into(),
            });
        }
        self.events.lock().push(event);
        Ok(())
    }
}

/// A process that runs until it is signaled or told to exit.
pub struct FakeProcess {
    pid: u32,
    exit: watch::Sender<Option<u32>>,
    log: CallLog,
}

impl FakeProcess {
    fn new(pid: u32, log: CallLog) -> Self {
        let (exit, _) = watch::channel(None);
        Self { pid, exit, log }
    }

    /// Makes the process exit with `code` unless it already exited.
    pub fn exit(&self, code: u32) {
        let _ = self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }
}

#[async_trait]
impl ContainerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn signal(&self, signal: u32) -> Result<(), HandleError> {
        self.log.record(format!("process.signal({}, {signal})", self.pid));
        if self.exit.borrow().is_some() {
            return Err(HandleError::AlreadyStopped);
        }
        self.exit(128 + signal);
        Ok(())
    }

    async fn wait(&self) -> Result<u32, HandleError> {
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| HandleError::failed("wait process", e.to_string()))?;
        Ok(code.unwrap_or(UNKNOWN_EXIT_STATUS))
    }

    async fn resize_console(&self, width: u32, height: u32) -> Result<(), HandleError> {
        self.log
            .record(format!("process.resize_console({}, {width}x{height})", self.pid));
        Ok(())
    }

    async fn close_stdin(&self) -> Result<(), HandleError> {
        self.log.record(format!("process.close_stdin({})", self.pid));
        Ok(())
    }

    async fn close(&self) -> Result<(), HandleError> {
        Ok(())
    }
}

/// A container whose teardown results are scripted by the test.
///
/// `close` succeeds once and reports `AlreadyClosed` afterwards.
pub struct FakeContainer {
    log: CallLog,
    next_pid: AtomicU32,
    fail_process_creation: bool,
    shutdown: std::result::Result<(), HandleError>,
    terminate: std::result::Result<(), HandleError>,
    wait_timeout: std::result::Result<(), HandleError>,
    closed: AtomicBool,
    processes: Mutex<Vec<(String, Arc<FakeProcess>)>>,
}

impl FakeContainer {
    /// Creates a container whose every operation succeeds.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next_pid: AtomicU32::new(1000),
            fail_process_creation: false,
            shutdown: Ok(()),
            terminate: Ok(()),
            wait_timeout: Ok(()),
            closed: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
        }
    }

    /// Sets the pid of the first process; later ones count up from it.
    #[must_use]
    pub fn with_first_pid(self, pid: u32) -> Self {
        self.next_pid.store(pid, Ordering::SeqCst);
        self
    }

    /// Makes process creation fail.
    #[must_use]
    pub fn failing_process_creation(mut self) -> Self {
        self.fail_process_creation = true;
        self
    }

    /// Scripts the result of `shutdown`.
    #[must_use]
    pub fn with_shutdown(mut self, result: std::result::Result<(), HandleError>) -> Self {
        self.shutdown = result;
        self
    }

    /// Scripts the result of `terminate`.
    #[must_use]
    pub fn with_terminate(mut self, result: std::result::Result<(), HandleError>) -> Self {
        self.terminate = result;
        self
    }

    /// Scripts the result of `wait_timeout`.
    #[must_use]
    pub fn with_wait_timeout(mut self, result: std::result::Result<(), HandleError>) -> Self {
        self.wait_timeout = result;
        self
    }

    /// Returns the process created for `exec_id`, if any.
    pub fn process(&self, exec_id: &str) -> Option<Arc<FakeProcess>> {
        self.processes
            .lock()
            .iter()
            .find(|(eid, _)| eid == exec_id)
            .map(|(_, p)| Arc::clone(p))
    }

    /// Returns `true` once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerHandle for FakeContainer {
    async fn start(&self) -> Result<(), HandleError> {
        self.log.record("container.start");
        Ok(())
    }

    async fn create_process(
        &self,
        config: &ProcessConfig,
    ) -> Result<Arc<dyn ContainerProcess>, HandleError> {
        self.log
            .record(format!("container.create_process({})", config.exec_id));
        if self.fail_process_creation {
            return Err(HandleError::failed("create process", "injected failure"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(FakeProcess::new(pid, self.log.clone()));
        self.processes
            .lock()
            .push((config.exec_id.clone(), Arc::clone(&process)));
        Ok(process)
    }

    async fn shutdown(&self) -> Result<(), HandleError> {
        self.log.record("container.shutdown");
        self.shutdown.clone()
    }

    async fn terminate(&self) -> Result<(), HandleError> {
        self.log.record("container.terminate");
        self.terminate.clone()
    }

    async fn wait_timeout(&self, timeout: Duration) -> Result<(), HandleError> {
        self.log
            .record(format!("container.wait_timeout({}s)", timeout.as_secs()));
        self.wait_timeout.clone()
    }

    async fn close(&self) -> Result<(), HandleError> {
        self.log.record("container.close");
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(HandleError::AlreadyClosed);
        }
        Ok(())
    }
}

/// A boundary that counts its starts and closes.
pub struct FakeBoundary {
    id: String,
    log: CallLog,
    fail_start: bool,
    starts: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeBoundary {
    /// Creates a boundary whose operations succeed.
    pub fn new(id: impl Into<String>, log: CallLog) -> Self {
        Self {
            id: id.into(),
            log,
            fail_start: false,
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Makes `start` fail.
    #[must_use]
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Number of `start` calls.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Boundary for FakeBoundary {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), HandleError> {
        self.log.record(format!("boundary.start({})", self.id));
        let _ = self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(HandleError::failed("start boundary", "injected failure"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), HandleError> {
        self.log.record(format!("boundary.close({})", self.id));
        if self.closes.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(HandleError::AlreadyClosed);
        }
        Ok(())
    }
}

/// Provisioner handing out [`FakeBoundary`]s.
pub struct FakeProvisioner {
    log: CallLog,
    supports_isolation: bool,
    fail_start: bool,
    created: Mutex<Vec<(BoundaryOptions, Arc<FakeBoundary>)>>,
}

impl FakeProvisioner {
    /// Creates a provisioner on a host that supports isolation.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            supports_isolation: true,
            fail_start: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Reports that the host cannot provide isolation.
    #[must_use]
    pub fn without_isolation(mut self) -> Self {
        self.supports_isolation = false;
        self
    }

    /// Hands out boundaries whose `start` fails.
    #[must_use]
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Options and boundaries created so far.
    pub fn created(&self) -> Vec<(BoundaryOptions, Arc<FakeBoundary>)> {
        self.created.lock().clone()
    }

    fn provision(&self, options: BoundaryOptions) -> Arc<dyn Boundary> {
        let mut boundary = FakeBoundary::new(options.id(), self.log.clone());
        if self.fail_start {
            boundary = boundary.failing_start();
        }
        let boundary = Arc::new(boundary);
        self.created.lock().push((options, Arc::clone(&boundary)));
        boundary
    }
}

#[async_trait]
impl BoundaryProvisioner for FakeProvisioner {
    fn supports_isolation(&self) -> bool {
        self.supports_isolation
    }

    async fn create_linux(
        &self,
        options: LinuxBoundaryOptions,
    ) -> Result<Arc<dyn Boundary>, HandleError> {
        self.log.record(format!("provisioner.create_linux({})", options.id));
        Ok(self.provision(BoundaryOptions::Linux(options)))
    }

    async fn create_windows(
        &self,
        options: WindowsBoundaryOptions,
    ) -> Result<Arc<dyn Boundary>, HandleError> {
        self.log.record(format!("provisioner.create_windows({})", options.id));
        Ok(self.provision(BoundaryOptions::Windows(options)))
    }
}

/// Engine handing out [`FakeContainer`]s with one attached layer each.
pub struct FakeEngine {
    log: CallLog,
    fail_create: bool,
    first_pid: u32,
    containers: Mutex<Vec<(ContainerCreateOptions, Arc<FakeContainer>)>>,
}

impl FakeEngine {
    /// Creates an engine whose containers number processes from 1000.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_create: false,
            first_pid: 1000,
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Makes container creation fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Sets the first process pid of every created container.
    #[must_use]
    pub fn with_first_pid(mut self, pid: u32) -> Self {
        self.first_pid = pid;
        self
    }

    /// Options and containers created so far.
    pub fn containers(&self) -> Vec<(ContainerCreateOptions, Arc<FakeContainer>)> {
        self.containers.lock().clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_container(
        &self,
        options: &ContainerCreateOptions,
    ) -> Result<(Arc<dyn ContainerHandle>, Resources), HandleError> {
        self.log
            .record(format!("engine.create_container({})", options.id));
        if self.fail_create {
            return Err(HandleError::failed("create container", "injected failure"));
        }
        let container =
            Arc::new(FakeContainer::new(self.log.clone()).with_first_pid(self.first_pid));
        self.containers
            .lock()
            .push((options.clone(), Arc::clone(&container)));
        let resources = Resources {
            entries: vec![AttachedResource {
                kind: ResourceKind::Layer,
                host_path: format!("/layers/{}", options.id),
                guest_path: None,
            }],
        };
        Ok((container, resources))
    }
}

/// Releaser that records what it was asked to release.
pub struct FakeReleaser {
    log: CallLog,
    fail: bool,
}

impl FakeReleaser {
    /// Creates a releaser that succeeds.
    pub const fn new(log: CallLog) -> Self {
        Self { log, fail: false }
    }

    /// Makes every release fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl ResourceReleaser for FakeReleaser {
    async fn release(
        &self,
        resources: Resources,
        boundary: Option<Arc<dyn Boundary>>,
        force: bool,
    ) -> Result<(), HandleError> {
        self.log.record(format!(
            "releaser.release({}, boundary={}, {})",
            resources.entries.len(),
            boundary.as_ref().map_or("none", |b| b.id()),
            if force { "force" } else { "graceful" },
        ));
        if self.fail {
            return Err(HandleError::failed("release resources", "injected failure"));
        }
        Ok(())
    }
}
