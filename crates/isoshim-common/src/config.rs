//! Configuration model for the shim runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ADDRESS, DEFAULT_NAMESPACE, DEFAULT_PUBLISH_BINARY, SHUTDOWN_TIMEOUT_SECS,
    TERMINATE_TIMEOUT_SECS,
};
use crate::error::{Result, ShimError};

/// Root configuration for the shim runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Namespace events are published into.
    pub namespace: String,
    /// Address of the event receiver.
    pub address: String,
    /// Binary invoked to forward events.
    pub publish_binary: PathBuf,
    /// Bound on waiting for a pending graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Bound on waiting for a pending forced terminate, in seconds.
    pub terminate_timeout_secs: u64,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            address: DEFAULT_ADDRESS.into(),
            publish_binary: PathBuf::from(DEFAULT_PUBLISH_BINARY),
            shutdown_timeout_secs: SHUTDOWN_TIMEOUT_SECS,
            terminate_timeout_secs: TERMINATE_TIMEOUT_SECS,
        }
    }
}

impl ShimConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| ShimError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&data).map_err(|e| ShimError::Config {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Returns the graceful shutdown wait bound.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the forced terminate wait bound.
    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Resolves the publish binary, searching `PATH` for bare names.
    ///
    /// # Errors
    ///
    /// Returns an error if a bare binary name is not found on `PATH`.
    pub fn resolve_publish_binary(&self) -> Result<PathBuf> {
        if self.publish_binary.is_absolute() {
            return Ok(self.publish_binary.clone());
        }
        which::which(&self.publish_binary).map_err(|e| ShimError::Config {
            message: format!(
                "publish binary '{}' not found: {e}",
                self.publish_binary.display()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_fixed_bounds() {
        let cfg = ShimConfig::default();
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.terminate_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn from_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shim.json");
        std::fs::write(&path, r#"{"namespace":"k8s.io","terminate_timeout_secs":5}"#).unwrap();

        let cfg = ShimConfig::from_file(&path).unwrap();
        assert_eq!(cfg.namespace, "k8s.io");
        assert_eq!(cfg.terminate_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.address, DEFAULT_ADDRESS);
    }

    #[test]
    fn from_file_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shim.json");
        std::fs::write(&path, "not json").unwrap();

        let err = ShimConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ShimError::Config { .. }));
    }

    #[test]
    fn from_file_reports_missing_file_as_io() {
        let err = ShimConfig::from_file(Path::new("/nonexistent/shim.json")).unwrap_err();
        assert!(matches!(err, ShimError::Io { .. }));
    }

    #[test]
    fn absolute_publish_binary_is_used_as_is() {
        let cfg = ShimConfig {
            publish_binary: PathBuf::from("/usr/bin/containerd"),
            ..ShimConfig::default()
        };
        assert_eq!(
            cfg.resolve_publish_binary().unwrap(),
            PathBuf::from("/usr/bin/containerd")
        );
    }
}
