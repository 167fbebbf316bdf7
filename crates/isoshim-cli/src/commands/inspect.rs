//! `isoshim inspect`: Show how a bundle would be created as a task.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use isoshim_common::constants::BIN_NAME;
use isoshim_common::types::{IsolationKind, TaskId};
use isoshim_runtime::backend::BoundaryOptions;
use isoshim_runtime::spec::{RuntimeSpec, SandboxType};
use isoshim_runtime::task::{TaskPlan, plan_task};
use serde::Serialize;

use crate::output::{format_mib, print_fields};

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Bundle directory containing `config.json`.
    #[arg(long)]
    pub bundle: PathBuf,

    /// Task id; defaults to the bundle directory name.
    #[arg(long)]
    pub id: Option<String>,

    /// Assume the host supports hardware isolation.
    #[arg(long)]
    pub isolation_supported: bool,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    id: String,
    isolation: IsolationKind,
    sandbox_type: SandboxType,
    network_namespace: Option<String>,
    boundary: Option<BoundaryReport>,
}

#[derive(Debug, Serialize)]
struct BoundaryReport {
    id: String,
    guest: &'static str,
    memory_mb: u64,
    processor_count: u32,
    detail: String,
}

impl Report {
    fn new(id: &TaskId, sandbox_type: SandboxType, plan: TaskPlan) -> Self {
        Self {
            id: id.to_string(),
            isolation: plan.isolation,
            sandbox_type,
            network_namespace: plan.network_namespace,
            boundary: plan.boundary.map(|options| match options {
                BoundaryOptions::Linux(o) => BoundaryReport {
                    id: o.id,
                    guest: "linux",
                    memory_mb: o.memory_mb,
                    processor_count: o.processor_count,
                    detail: o.boot_files_path.join(&o.kernel_file).display().to_string(),
                },
                BoundaryOptions::Windows(o) => BoundaryReport {
                    id: o.id,
                    guest: "windows",
                    memory_mb: o.memory_mb,
                    processor_count: o.processor_count,
                    detail: format!("{} layer folder(s)", o.layer_folders.len()),
                },
            }),
        }
    }

    fn print(&self) {
        let mut rows = vec![
            ("TASK", self.id.clone()),
            ("ISOLATION", self.isolation.to_string()),
            ("SANDBOX", self.sandbox_type.to_string()),
            (
                "NETWORK",
                self.network_namespace.clone().unwrap_or_else(|| "-".into()),
            ),
        ];
        match &self.boundary {
            Some(b) => rows.extend([
                ("BOUNDARY", format!("{} ({})", b.id, b.guest)),
                ("MEMORY", format_mib(b.memory_mb)),
                ("CPUS", b.processor_count.to_string()),
                ("DETAIL", b.detail.clone()),
            ]),
            None => rows.push(("BOUNDARY", "-".into())),
        }
        print_fields(&rows);
    }
}

fn task_id(args: &InspectArgs) -> TaskId {
    args.id.as_deref().map_or_else(
        || {
            TaskId::new(
                args.bundle
                    .file_name()
                    .map_or_else(|| "task".into(), |n| n.to_string_lossy().into_owned()),
            )
        },
        TaskId::new,
    )
}

fn plan(bundle: &Path, id: &TaskId, isolation_supported: bool) -> anyhow::Result<Report> {
    let spec = RuntimeSpec::from_bundle(bundle)
        .with_context(|| format!("reading runtime spec from {}", bundle.display()))?;
    let (sandbox_type, _) = spec.sandbox_type()?;
    let plan = plan_task(&spec, id, BIN_NAME, isolation_supported)?;
    Ok(Report::new(id, sandbox_type, plan))
}

/// Executes the `inspect` command.
///
/// Reads the bundle's runtime spec and runs the same validation and
/// boundary planning the task creation path uses, without creating
/// anything.
///
/// # Errors
///
/// Returns an error if the runtime spec cannot be read or is rejected.
pub fn execute(args: &InspectArgs) -> anyhow::Result<()> {
    let id = task_id(args);
    let report = plan(&args.bundle, &id, args.isolation_supported)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(config: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), config).unwrap();
        dir
    }

    #[test]
    fn plans_isolated_linux_bundle() {
        let dir = bundle(
            r#"{"linux":{},"annotations":{"io.microsoft.virtualmachine.computetopology.memory.sizeinmb":"2048"}}"#,
        );
        let id = TaskId::new("t1");
        let report = plan(dir.path(), &id, true).unwrap();

        assert_eq!(report.isolation, IsolationKind::HypervLinux);
        assert_eq!(report.sandbox_type, SandboxType::None);
        let boundary = report.boundary.unwrap();
        assert_eq!(boundary.id, "t1@vm");
        assert_eq!(boundary.guest, "linux");
        assert_eq!(boundary.memory_mb, 2048);
    }

    #[test]
    fn json_report_names_the_sandbox_type() {
        let dir = bundle(r#"{"windows":{"layerFolders":["/l"]}}"#);
        let id = TaskId::new("t1");
        let report = plan(dir.path(), &id, false).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sandbox_type"], "none");
        assert_eq!(json["isolation"], serde_json::to_value(report.isolation).unwrap());
        assert!(json["boundary"].is_null());
    }

    #[test]
    fn rejects_pod_member_bundle() {
        let dir = bundle(
            r#"{"windows":{"layerFolders":["/l"]},"annotations":{"io.kubernetes.cri.container-type":"sandbox","io.kubernetes.cri.sandbox-id":"pod"}}"#,
        );
        assert!(plan(dir.path(), &TaskId::new("t1"), true).is_err());
    }

    #[test]
    fn task_id_defaults_to_bundle_name() {
        let args = InspectArgs {
            bundle: PathBuf::from("/run/bundles/web-1"),
            id: None,
            isolation_supported: false,
            json: false,
        };
        assert_eq!(task_id(&args).as_str(), "web-1");
    }
}
