//! System-wide constants, annotation keys, and defaults.

/// Exec identifier reserved for the init exec of every task.
pub const INIT_EXEC_ID: &str = "";

/// Upper bound on waiting for a pending graceful container shutdown.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5 * 60;

/// Upper bound on waiting for a pending forced container terminate.
pub const TERMINATE_TIMEOUT_SECS: u64 = 30;

/// Exit status recorded when the real one could not be observed.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// Annotation naming the CRI container type of a runtime specification.
pub const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";

/// Annotation naming the pod sandbox a container belongs to.
pub const SANDBOX_ID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";

/// Annotation overriding the boundary memory size in MiB.
pub const MEMORY_SIZE_ANNOTATION: &str =
    "io.microsoft.virtualmachine.computetopology.memory.sizeinmb";

/// Annotation overriding the boundary virtual processor count.
pub const PROCESSOR_COUNT_ANNOTATION: &str =
    "io.microsoft.virtualmachine.computetopology.processor.count";

/// Annotation overriding the Linux guest boot files directory.
pub const BOOT_FILES_ANNOTATION: &str = "io.microsoft.virtualmachine.lcow.bootfilesrootpath";

/// Annotation overriding the Linux guest kernel file name.
pub const KERNEL_FILE_ANNOTATION: &str = "io.microsoft.virtualmachine.lcow.kernel";

/// Default boundary memory size in MiB.
pub const DEFAULT_BOUNDARY_MEMORY_MB: u64 = 1024;

/// Default boundary virtual processor count.
pub const DEFAULT_BOUNDARY_PROCESSORS: u32 = 2;

/// Default directory holding the Linux guest kernel and initrd.
pub const DEFAULT_BOOT_FILES_PATH: &str = r"C:\Program Files\Linux Containers";

/// Default Linux guest kernel file name.
pub const DEFAULT_KERNEL_FILE: &str = "kernel";

/// Suffix appended to a task id to name the boundary it owns.
pub const BOUNDARY_ID_SUFFIX: &str = "@vm";

/// Directory nested under the last layer that holds the boundary scratch.
pub const BOUNDARY_SCRATCH_DIR: &str = "vm";

/// Name of the runtime specification file inside a bundle.
pub const RUNTIME_SPEC_FILE: &str = "config.json";

/// Event topic published when a task is created.
pub const TASK_CREATE_TOPIC: &str = "/tasks/create";

/// Event topic published when an additional exec is added.
pub const TASK_EXEC_ADDED_TOPIC: &str = "/tasks/exec-added";

/// Event topic published when an exec is deleted.
pub const TASK_DELETE_TOPIC: &str = "/tasks/delete";

/// Default binary used to forward events.
pub const DEFAULT_PUBLISH_BINARY: &str = "containerd";

/// Default address of the event receiver.
pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";

/// Default namespace events are published into.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Application name used in CLI output and boundary ownership.
pub const APP_NAME: &str = "isoshim";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "isoshim";
