//! The parts of a runtime specification the shim reads.
//!
//! Validation of the full specification belongs to the container engine.
//! This module only answers the questions task creation asks: is this a
//! standalone container, does it request hardware isolation, and which
//! boundary options follow from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use isoshim_common::constants::{
    BOOT_FILES_ANNOTATION, CONTAINER_TYPE_ANNOTATION, DEFAULT_BOOT_FILES_PATH,
    DEFAULT_BOUNDARY_MEMORY_MB, DEFAULT_BOUNDARY_PROCESSORS, DEFAULT_KERNEL_FILE,
    KERNEL_FILE_ANNOTATION, MEMORY_SIZE_ANNOTATION, PROCESSOR_COUNT_ANNOTATION,
    RUNTIME_SPEC_FILE, SANDBOX_ID_ANNOTATION,
};
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::IsolationKind;
use serde::{Deserialize, Serialize};

use crate::backend::{BoundaryOptions, LinuxBoundaryOptions, WindowsBoundaryOptions};

/// Runtime specification of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Free-form annotations, including isolation and sandbox hints.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Init process of the container.
    #[serde(default)]
    pub process: Option<ProcessSpec>,
    /// Linux section. Its presence marks a Linux container.
    #[serde(default)]
    pub linux: Option<serde_json::Value>,
    /// Windows section.
    #[serde(default)]
    pub windows: Option<WindowsSpec>,
}

/// A process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: String,
    /// Whether a terminal is requested.
    #[serde(default)]
    pub terminal: bool,
}

/// Windows-specific section of a runtime specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsSpec {
    /// Image layers, base first, scratch last.
    #[serde(default)]
    pub layer_folders: Vec<PathBuf>,
    /// Hyper-V section. Its presence requests hardware isolation.
    #[serde(default)]
    pub hyperv: Option<HypervSpec>,
    /// Network section.
    #[serde(default)]
    pub network: Option<WindowsNetwork>,
}

/// Hyper-V isolation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervSpec {
    /// Path of the utility VM image.
    #[serde(default, rename = "utilityVMPath")]
    pub utility_vm_path: Option<PathBuf>,
}

/// Windows network settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsNetwork {
    /// Network namespace to join.
    #[serde(default)]
    pub network_namespace: Option<String>,
}

/// Role of a container within a pod, from the sandbox-type annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxType {
    /// No annotation: a standalone container.
    None,
    /// The pod sandbox container.
    Sandbox,
    /// A workload container inside a pod.
    Container,
}

impl FromStr for SandboxType {
    type Err = ShimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sandbox" => Ok(Self::Sandbox),
            "container" => Ok(Self::Container),
            other => Err(ShimError::Config {
                message: format!("unknown {CONTAINER_TYPE_ANNOTATION} value '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for SandboxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Sandbox => write!(f, "sandbox"),
            Self::Container => write!(f, "container"),
        }
    }
}

impl RuntimeSpec {
    /// Reads the runtime specification from `bundle/config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_bundle(bundle: &Path) -> Result<Self> {
        let path = bundle.join(RUNTIME_SPEC_FILE);
        let data = std::fs::read(&path).map_err(|e| ShimError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Returns the sandbox type and, for pod members, the sandbox id.
    ///
    /// # Errors
    ///
    /// Returns an error if the annotation holds an unknown value, or a pod
    /// member does not name its sandbox.
    pub fn sandbox_type(&self) -> Result<(SandboxType, Option<&str>)> {
        let Some(raw) = self.annotations.get(CONTAINER_TYPE_ANNOTATION) else {
            return Ok((SandboxType::None, None));
        };
        let kind = raw.parse::<SandboxType>()?;
        let sandbox_id = self.annotations.get(SANDBOX_ID_ANNOTATION).map(String::as_str);
        if sandbox_id.is_none_or(str::is_empty) {
            return Err(ShimError::Config {
                message: format!("{SANDBOX_ID_ANNOTATION} is required for a '{kind}' container"),
            });
        }
        Ok((kind, sandbox_id))
    }

    /// Returns `true` for a Windows container.
    #[must_use]
    pub const fn is_windows(&self) -> bool {
        self.linux.is_none() && self.windows.is_some()
    }

    /// Returns `true` when the specification requests hardware isolation.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.linux.is_some() || self.windows.as_ref().is_some_and(|w| w.hyperv.is_some())
    }

    /// Returns the isolation kind given whether the host supports isolation.
    #[must_use]
    pub fn isolation_kind(&self, host_supports_isolation: bool) -> IsolationKind {
        if host_supports_isolation && self.is_isolated() {
            if self.linux.is_some() {
                IsolationKind::HypervLinux
            } else {
                IsolationKind::HypervWindows
            }
        } else if self.is_windows() {
            IsolationKind::Process
        } else {
            IsolationKind::None
        }
    }

    /// Returns the network namespace named by the Windows section.
    #[must_use]
    pub fn network_namespace(&self) -> Option<&str> {
        self.windows
            .as_ref()
            .and_then(|w| w.network.as_ref())
            .and_then(|n| n.network_namespace.as_deref())
            .filter(|ns| !ns.is_empty())
    }

    /// Translates the specification into boundary options.
    ///
    /// A Linux section selects a Linux guest kernel; otherwise the Windows
    /// layer folders are carried over for a Windows guest.
    ///
    /// # Errors
    ///
    /// Returns an error if an annotation is malformed or a Windows guest has
    /// no layer folders.
    pub fn boundary_options(&self, id: &str, owner: &str) -> Result<BoundaryOptions> {
        let memory_mb = self.annotation_or(MEMORY_SIZE_ANNOTATION, DEFAULT_BOUNDARY_MEMORY_MB)?;
        let processor_count =
            self.annotation_or(PROCESSOR_COUNT_ANNOTATION, DEFAULT_BOUNDARY_PROCESSORS)?;

        if self.linux.is_some() {
            return Ok(BoundaryOptions::Linux(LinuxBoundaryOptions {
                id: id.to_owned(),
                owner: owner.to_owned(),
                memory_mb,
                processor_count,
                boot_files_path: self
                    .annotations
                    .get(BOOT_FILES_ANNOTATION)
                    .map_or_else(|| PathBuf::from(DEFAULT_BOOT_FILES_PATH), PathBuf::from),
                kernel_file: self
                    .annotations
                    .get(KERNEL_FILE_ANNOTATION)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_KERNEL_FILE.to_owned()),
            }));
        }

        let layer_folders = self
            .windows
            .as_ref()
            .map(|w| w.layer_folders.clone())
            .unwrap_or_default();
        if layer_folders.is_empty() {
            return Err(ShimError::Config {
                message: "windows boundary requires at least one layer folder".into(),
            });
        }
        Ok(BoundaryOptions::Windows(WindowsBoundaryOptions {
            id: id.to_owned(),
            owner: owner.to_owned(),
            memory_mb,
            processor_count,
            layer_folders,
        }))
    }

    fn annotation_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.annotations.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ShimError::Config {
                message: format!("annotation {key} has invalid value '{raw}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows_spec(hyperv: bool) -> RuntimeSpec {
        RuntimeSpec {
            windows: Some(WindowsSpec {
                layer_folders: vec![PathBuf::from("/layers/base"), PathBuf::from("/layers/scratch")],
                hyperv: hyperv.then(HypervSpec::default),
                network: None,
            }),
            ..RuntimeSpec::default()
        }
    }

    fn linux_spec() -> RuntimeSpec {
        RuntimeSpec {
            linux: Some(serde_json::json!({})),
            windows: Some(WindowsSpec::default()),
            ..RuntimeSpec::default()
        }
    }

    #[test]
    fn missing_annotation_is_standalone() {
        let spec = RuntimeSpec::default();
        let (kind, sandbox) = spec.sandbox_type().unwrap();
        assert_eq!(kind, SandboxType::None);
        assert!(sandbox.is_none());
    }

    #[test]
    fn pod_member_requires_sandbox_id() {
        let mut spec = RuntimeSpec::default();
        let _ = spec
            .annotations
            .insert(CONTAINER_TYPE_ANNOTATION.into(), "container".into());
        assert!(spec.sandbox_type().is_err());

        let _ = spec
            .annotations
            .insert(SANDBOX_ID_ANNOTATION.into(), "pod-1".into());
        let (kind, sandbox) = spec.sandbox_type().unwrap();
        assert_eq!(kind, SandboxType::Container);
        assert_eq!(sandbox, Some("pod-1"));
    }

    #[test]
    fn unknown_sandbox_type_is_rejected() {
        let mut spec = RuntimeSpec::default();
        let _ = spec
            .annotations
            .insert(CONTAINER_TYPE_ANNOTATION.into(), "daemonset".into());
        assert!(matches!(spec.sandbox_type(), Err(ShimError::Config { .. })));
    }

    #[test]
    fn isolation_kind_follows_sections_and_host_support() {
        assert_eq!(windows_spec(false).isolation_kind(true), IsolationKind::Process);
        assert_eq!(windows_spec(true).isolation_kind(true), IsolationKind::HypervWindows);
        assert_eq!(windows_spec(true).isolation_kind(false), IsolationKind::Process);
        assert_eq!(linux_spec().isolation_kind(true), IsolationKind::HypervLinux);
        assert_eq!(RuntimeSpec::default().isolation_kind(true), IsolationKind::None);
    }

    #[test]
    fn linux_section_selects_linux_boundary_with_defaults() {
        let opts = linux_spec().boundary_options("t1@vm", "isoshim").unwrap();
        let BoundaryOptions::Linux(linux) = opts else {
            panic!("expected linux options");
        };
        assert_eq!(linux.id, "t1@vm");
        assert_eq!(linux.memory_mb, DEFAULT_BOUNDARY_MEMORY_MB);
        assert_eq!(linux.processor_count, DEFAULT_BOUNDARY_PROCESSORS);
        assert_eq!(linux.kernel_file, DEFAULT_KERNEL_FILE);
    }

    #[test]
    fn annotations_override_boundary_sizing() {
        let mut spec = windows_spec(true);
        let _ = spec
            .annotations
            .insert(MEMORY_SIZE_ANNOTATION.into(), "2048".into());
        let _ = spec
            .annotations
            .insert(PROCESSOR_COUNT_ANNOTATION.into(), "4".into());

        let BoundaryOptions::Windows(win) = spec.boundary_options("t1@vm", "isoshim").unwrap()
        else {
            panic!("expected windows options");
        };
        assert_eq!(win.memory_mb, 2048);
        assert_eq!(win.processor_count, 4);
        assert_eq!(win.layer_folders.len(), 2);
    }

    #[test]
    fn malformed_annotation_is_config_error() {
        let mut spec = windows_spec(true);
        let _ = spec
            .annotations
            .insert(MEMORY_SIZE_ANNOTATION.into(), "lots".into());
        assert!(matches!(
            spec.boundary_options("t1@vm", "isoshim"),
            Err(ShimError::Config { .. })
        ));
    }

    #[test]
    fn windows_boundary_without_layers_is_rejected() {
        let spec = RuntimeSpec {
            windows: Some(WindowsSpec {
                hyperv: Some(HypervSpec::default()),
                ..WindowsSpec::default()
            }),
            ..RuntimeSpec::default()
        };
        assert!(spec.boundary_options("t1@vm", "isoshim").is_err());
    }

    #[test]
    fn parses_spec_from_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(RUNTIME_SPEC_FILE),
            r#"{
                "process": {"args": ["cmd.exe"], "cwd": "C:\\"},
                "windows": {
                    "layerFolders": ["C:\\l\\base", "C:\\l\\scratch"],
                    "network": {"networkNamespace": "ns-1"}
                }
            }"#,
        )
        .unwrap();

        let spec = RuntimeSpec::from_bundle(dir.path()).unwrap();
        assert!(spec.is_windows());
        assert!(!spec.is_isolated());
        assert_eq!(spec.network_namespace(), Some("ns-1"));
        assert_eq!(spec.process.unwrap().args, vec!["cmd.exe"]);
    }
}
