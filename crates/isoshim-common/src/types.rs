//! Domain primitive types used across the isoshim workspace.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a task, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an exec. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    /// The exec exists but its process has not been started.
    Created,
    /// The process is running.
    Running,
    /// The process has exited. Terminal.
    Exited,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Observed status of an exec.
///
/// `exit_status` and `exited_at` are only meaningful once the exec is
/// [`ExecState::Exited`] and never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    /// OS process identifier, zero until the exec is started.
    pub pid: u32,
    /// Exit status of the process.
    pub exit_status: u32,
    /// Time the exit was observed.
    pub exited_at: Option<DateTime<Utc>>,
}

impl ExecStatus {
    /// Status of an exec that has not exited yet.
    #[must_use]
    pub const fn pending(pid: u32) -> Self {
        Self {
            pid,
            exit_status: 0,
            exited_at: None,
        }
    }
}

/// A process id paired with the exec that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PidPair {
    /// OS process identifier.
    pub pid: u32,
    /// Exec identifier, empty for the init exec.
    pub exec_id: String,
}

/// How a task's container is isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// No isolation boundary is involved.
    None,
    /// Windows process-isolated container running on the host kernel.
    Process,
    /// Linux container inside a hardware-isolated boundary.
    HypervLinux,
    /// Windows container inside a hardware-isolated boundary.
    HypervWindows,
}

impl IsolationKind {
    /// Returns `true` when the container lives inside a boundary.
    #[must_use]
    pub const fn is_hypervisor(self) -> bool {
        matches!(self, Self::HypervLinux | Self::HypervWindows)
    }
}

impl fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Process => write!(f, "process"),
            Self::HypervLinux => write!(f, "hyperv-linux"),
            Self::HypervWindows => write!(f, "hyperv-windows"),
        }
    }
}

/// Addresses of the standard streams relayed for a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Standard input address, empty when not attached.
    #[serde(default)]
    pub stdin: String,
    /// Standard output address, empty when not attached.
    #[serde(default)]
    pub stdout: String,
    /// Standard error address, empty when not attached.
    #[serde(default)]
    pub stderr: String,
    /// Whether a terminal is allocated.
    #[serde(default)]
    pub terminal: bool,
}

/// A root filesystem mount handed over with a creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsMount {
    /// Mount type, e.g. `windows-layer` or `lcow-layer`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Mount source.
    pub source: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_state_display_is_lowercase() {
        assert_eq!(ExecState::Created.to_string(), "created");
        assert_eq!(ExecState::Running.to_string(), "running");
        assert_eq!(ExecState::Exited.to_string(), "exited");
    }

    #[test]
    fn pending_status_has_no_exit_time() {
        let status = ExecStatus::pending(42);
        assert_eq!(status.pid, 42);
        assert!(status.exited_at.is_none());
    }

    #[test]
    fn only_boundary_kinds_are_hypervisor() {
        assert!(IsolationKind::HypervLinux.is_hypervisor());
        assert!(IsolationKind::HypervWindows.is_hypervisor());
        assert!(!IsolationKind::Process.is_hypervisor());
        assert!(!IsolationKind::None.is_hypervisor());
    }

    #[test]
    fn rootfs_mount_reads_type_field() {
        let m: RootfsMount =
            serde_json::from_str(r#"{"type":"windows-layer","source":"C:\\layers\\1"}"#).unwrap();
        assert_eq!(m.kind, "windows-layer");
        assert!(m.options.is_empty());
    }
}
