//! Task lifecycle events and their delivery.
//!
//! Publication goes through one process-owned [`EventQueue`]: publishers
//! enqueue without blocking, and a single writer task hands events to the
//! [`EventSink`] in the order they were published.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isoshim_common::config::ShimConfig;
use isoshim_common::constants::{TASK_CREATE_TOPIC, TASK_DELETE_TOPIC, TASK_EXEC_ADDED_TOPIC};
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{RootfsMount, StdioConfig};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Published when a task has been created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreateEvent {
    /// Task (container) identifier.
    pub container_id: String,
    /// Bundle directory.
    pub bundle: PathBuf,
    /// Root filesystem mounts.
    pub rootfs: Vec<RootfsMount>,
    /// Standard stream addresses of the init process.
    pub io: StdioConfig,
    /// Process id of the init exec.
    pub pid: u32,
}

/// Published when an additional exec has been added to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAddedEvent {
    /// Task (container) identifier.
    pub container_id: String,
    /// Identifier of the new exec.
    pub exec_id: String,
}

/// Published when an exec has been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDeleteEvent {
    /// Task (container) identifier.
    pub container_id: String,
    /// Identifier of the deleted exec, empty for the init exec.
    pub exec_id: String,
    /// Process id of the deleted exec.
    pub pid: u32,
    /// Exit status of the deleted exec.
    pub exit_status: u32,
    /// Time the exit was observed.
    pub exited_at: Option<DateTime<Utc>>,
}

/// A task lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A task was created.
    Create(TaskCreateEvent),
    /// An exec was added.
    ExecAdded(ExecAddedEvent),
    /// An exec was deleted.
    Delete(TaskDeleteEvent),
}

impl TaskEvent {
    /// Topic the event is published on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Create(_) => TASK_CREATE_TOPIC,
            Self::ExecAdded(_) => TASK_EXEC_ADDED_TOPIC,
            Self::Delete(_) => TASK_DELETE_TOPIC,
        }
    }

    /// Identifier of the task the event belongs to.
    #[must_use]
    pub fn container_id(&self) -> &str {
        match self {
            Self::Create(e) => &e.container_id,
            Self::ExecAdded(e) => &e.container_id,
            Self::Delete(e) => &e.container_id,
        }
    }

    /// Encodes the event payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Create(e) => serde_json::to_vec(e)?,
            Self::ExecAdded(e) => serde_json::to_vec(e)?,
            Self::Delete(e) => serde_json::to_vec(e)?,
        };
        Ok(bytes)
    }
}

/// Emits lifecycle events. Synchronous, no delivery retry.
pub trait Publisher: Send + Sync {
    /// Publishes `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be handed to the transport.
    fn publish(&self, event: TaskEvent) -> Result<()>;
}

/// Final destination of encoded events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one encoded event.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Single-writer event queue owned by the process.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl EventQueue {
    /// Creates the queue and spawns its writer task.
    ///
    /// The writer stops once every clone of the queue has been dropped and
    /// the backlog is drained.
    pub fn spawn(sink: Arc<dyn EventSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.topic();
                let payload = match event.encode() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(topic, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = sink.deliver(topic, payload).await {
                    tracing::error!(topic, cid = event.container_id(), error = %e, "failed to deliver event");
                }
            }
            tracing::debug!("event writer stopped");
        });
        (Self { tx }, writer)
    }
}

impl Publisher for EventQueue {
    fn publish(&self, event: TaskEvent) -> Result<()> {
        let topic = event.topic();
        tracing::debug!(topic, cid = event.container_id(), "publishing event");
        self.tx.send(event).map_err(|_| ShimError::Publish {
            topic: topic.to_owned(),
            message: "event writer has stopped".into(),
        })
    }
}

/// Delivers events by running the publish binary once per event.
///
/// The payload is written to the child's stdin.
#[derive(Debug, Clone)]
pub struct CommandSink {
    binary: PathBuf,
    address: String,
    namespace: String,
}

impl CommandSink {
    /// Creates a sink invoking `binary`.
    #[must_use]
    pub fn new(binary: PathBuf, address: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            binary,
            address: address.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates a sink from the shim configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the publish binary cannot be located.
    pub fn from_config(config: &ShimConfig) -> Result<Self> {
        Ok(Self::new(
            config.resolve_publish_binary()?,
            config.address.clone(),
            config.namespace.clone(),
        ))
    }
}

#[async_trait]
impl EventSink for CommandSink {
    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let publish_err = |message: String| ShimError::Publish {
            topic: topic.to_owned(),
            message,
        };

        let mut child = tokio::process::Command::new(&self.binary)
            .args(["--address", &self.address, "publish", "--topic", topic])
            .args(["--namespace", &self.namespace])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ShimError::Io {
                path: self.binary.clone(),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| publish_err(format!("write payload: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| publish_err(format!("wait for publisher: {e}")))?;
        if !output.status.success() {
            return Err(publish_err(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemorySink {
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.delivered.lock().push((topic.to_owned(), payload));
            Ok(())
        }
    }

    fn exec_added(eid: &str) -> TaskEvent {
        TaskEvent::ExecAdded(ExecAddedEvent {
            container_id: "t1".into(),
            exec_id: eid.into(),
        })
    }

    #[test]
    fn topics_match_event_kinds() {
        assert_eq!(exec_added("e1").topic(), TASK_EXEC_ADDED_TOPIC);
        let delete = TaskEvent::Delete(TaskDeleteEvent {
            container_id: "t1".into(),
            exec_id: String::new(),
            pid: 100,
            exit_status: 0,
            exited_at: None,
        });
        assert_eq!(delete.topic(), TASK_DELETE_TOPIC);
        assert_eq!(delete.container_id(), "t1");
    }

    #[tokio::test]
    async fn queue_delivers_in_publish_order() {
        let sink = Arc::new(MemorySink::default());
        let (queue, writer) = EventQueue::spawn(Arc::clone(&sink) as Arc<dyn EventSink>);

        for eid in ["e1", "e2", "e3"] {
            queue.publish(exec_added(eid)).unwrap();
        }
        drop(queue);
        writer.await.unwrap();

        let delivered = sink.delivered.lock();
        let ids: Vec<String> = delivered
            .iter()
            .map(|(_, p)| serde_json::from_slice::<ExecAddedEvent>(p).unwrap().exec_id)
            .collect();
        assert_eq!(ids, ["e1", "e2", "e3"]);
        assert!(delivered.iter().all(|(t, _)| t == TASK_EXEC_ADDED_TOPIC));
    }

    #[tokio::test]
    async fn publish_fails_once_writer_is_gone() {
        let (queue, writer) = EventQueue::spawn(Arc::new(MemorySink::default()));
        writer.abort();
        let _ = writer.await;

        let err = queue.publish(exec_added("e1")).unwrap_err();
        assert!(matches!(err, ShimError::Publish { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("publisher.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_sink_passes_topic_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let bin = script(
            dir.path(),
            &format!("echo \"$@\" > {0}.args\ncat > {0}.payload", out.display()),
        );

        let sink = CommandSink::new(bin, "/run/test.sock", "k8s.io");
        sink.deliver(TASK_CREATE_TOPIC, b"{\"pid\":1}".to_vec())
            .await
            .unwrap();

        let args = std::fs::read_to_string(dir.path().join("out.args")).unwrap();
        assert_eq!(
            args.trim(),
            "--address /run/test.sock publish --topic /tasks/create --namespace k8s.io"
        );
        let payload = std::fs::read(dir.path().join("out.payload")).unwrap();
        assert_eq!(payload, b"{\"pid\":1}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_sink_reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "cat > /dev/null\necho refused >&2\nexit 3");

        let sink = CommandSink::new(bin, "addr", "ns");
        let err = sink.deliver(TASK_DELETE_TOPIC, b"{}".to_vec()).await.unwrap_err();
        match err {
            ShimError::Publish { topic, message } => {
                assert_eq!(topic, TASK_DELETE_TOPIC);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
