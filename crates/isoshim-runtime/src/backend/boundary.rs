//! Hardware-isolation boundaries and their provisioning options.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::HandleError;

/// Options for a boundary running a Linux guest kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxBoundaryOptions {
    /// Boundary identifier.
    pub id: String,
    /// Owner recorded against the boundary.
    pub owner: String,
    /// Memory size in MiB.
    pub memory_mb: u64,
    /// Virtual processor count.
    pub processor_count: u32,
    /// Directory holding the kernel and initrd.
    pub boot_files_path: PathBuf,
    /// Kernel file name inside `boot_files_path`.
    pub kernel_file: String,
}

/// Options for a boundary running a Windows guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsBoundaryOptions {
    /// Boundary identifier.
    pub id: String,
    /// Owner recorded against the boundary.
    pub owner: String,
    /// Memory size in MiB.
    pub memory_mb: u64,
    /// Virtual processor count.
    pub processor_count: u32,
    /// Image layers, the last one holding the boundary scratch.
    pub layer_folders: Vec<PathBuf>,
}

/// Boundary options, decided once when the runtime specification is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryOptions {
    /// Linux guest kernel.
    Linux(LinuxBoundaryOptions),
    /// Windows guest.
    Windows(WindowsBoundaryOptions),
}

impl BoundaryOptions {
    /// Returns the boundary identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Linux(o) => &o.id,
            Self::Windows(o) => &o.id,
        }
    }
}

impl fmt::Display for BoundaryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux(o) => write!(
                f,
                "linux boundary {} ({} MiB, {} vCPU, kernel {})",
                o.id,
                o.memory_mb,
                o.processor_count,
                o.boot_files_path.join(&o.kernel_file).display()
            ),
            Self::Windows(o) => write!(
                f,
                "windows boundary {} ({} MiB, {} vCPU, {} layer(s))",
                o.id,
                o.memory_mb,
                o.processor_count,
                o.layer_folders.len()
            ),
        }
    }
}

/// A started (or startable) isolation boundary hosting containers.
#[async_trait]
pub trait Boundary: Send + Sync {
    /// Returns the boundary identifier.
    fn id(&self) -> &str;

    /// Boots the boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundary fails to start.
    async fn start(&self) -> Result<(), HandleError>;

    /// Shuts down and releases the boundary. Tolerates repeated calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundary could not be closed.
    async fn close(&self) -> Result<(), HandleError>;
}

/// Creates boundaries, one entry point per guest kernel kind.
#[async_trait]
pub trait BoundaryProvisioner: Send + Sync {
    /// Returns whether the host supports hardware isolation at all.
    fn supports_isolation(&self) -> bool;

    /// Creates a boundary running a Linux guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundary cannot be created.
    async fn create_linux(
        &self,
        options: LinuxBoundaryOptions,
    ) -> Result<Arc<dyn Boundary>, HandleError>;

    /// Creates a boundary running a Windows guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundary cannot be created.
    async fn create_windows(
        &self,
        options: WindowsBoundaryOptions,
    ) -> Result<Arc<dyn Boundary>, HandleError>;
}
