//! Creation of standalone tasks, which are not members of a pod.
//!
//! A standalone task always owns the boundary it creates. Any failure before
//! the task is assembled closes that boundary again.

use std::path::Path;
use std::sync::Arc;

use isoshim_common::constants::{
    APP_NAME, BOUNDARY_ID_SUFFIX, BOUNDARY_SCRATCH_DIR, CONTAINER_TYPE_ANNOTATION,
};
use isoshim_common::error::{Result, ShimError};
use isoshim_common::types::{IsolationKind, TaskId};

use super::container::{ContainerParts, ContainerTask};
use super::{Collaborators, CreateTaskRequest};
use crate::backend::{
    Boundary, BoundaryOptions, BoundaryProvisioner, ContainerCreateOptions, HandleError,
    WindowsBoundaryOptions,
};
use crate::spec::{RuntimeSpec, SandboxType};

/// Decisions derived from a runtime specification before anything is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    /// How the container will be isolated.
    pub isolation: IsolationKind,
    /// Options of the boundary to provision, for hardware isolation.
    pub boundary: Option<BoundaryOptions>,
    /// Network namespace the container joins.
    pub network_namespace: Option<String>,
}

/// Validates `spec` for a standalone task and derives its plan.
///
/// # Errors
///
/// Returns a failed precondition if the specification marks a pod member or
/// describes no supported container shape, and a configuration error if an
/// annotation cannot be parsed.
pub fn plan_task(
    spec: &RuntimeSpec,
    id: &TaskId,
    owner: &str,
    host_supports_isolation: bool,
) -> Result<TaskPlan> {
    let (sandbox_type, _) = spec.sandbox_type()?;
    if sandbox_type != SandboxType::None {
        return Err(ShimError::precondition(format!(
            "cannot create standalone task, expected no '{CONTAINER_TYPE_ANNOTATION}' annotation, got '{sandbox_type}'"
        )));
    }

    let isolation = spec.isolation_kind(host_supports_isolation);
    let boundary = if isolation.is_hypervisor() {
        Some(spec.boundary_options(&format!("{id}{BOUNDARY_ID_SUFFIX}"), owner)?)
    } else if spec.is_windows() {
        None
    } else {
        return Err(ShimError::precondition(
            "runtime spec describes neither an isolated nor a process-isolated windows container",
        ));
    };

    Ok(TaskPlan {
        isolation,
        boundary,
        network_namespace: spec.network_namespace().map(str::to_owned),
    })
}

/// Creates a standalone task: boundary, container, init exec, teardown flow.
///
/// # Errors
///
/// Returns the planning error, or the backend error of the step that failed.
/// A boundary started along the way is closed before returning.
pub async fn new_standalone_task(
    deps: &Collaborators,
    req: CreateTaskRequest,
) -> Result<Arc<ContainerTask>> {
    tracing::debug!(tid = %req.id, bundle = %req.bundle.display(), "creating standalone task");
    let owner = owner_name();
    let plan = plan_task(
        &req.spec,
        &req.id,
        &owner,
        deps.provisioner.supports_isolation(),
    )?;

    let boundary = match plan.boundary {
        Some(options) => Some(provision_boundary(deps.provisioner.as_ref(), options).await?),
        None => None,
    };

    let options = ContainerCreateOptions {
        id: req.id.clone(),
        owner,
        spec: req.spec.clone(),
        network_namespace: plan.network_namespace,
        boundary: boundary.clone(),
    };
    let (container, resources) = match deps.engine.create_container(&options).await {
        Ok(created) => created,
        Err(e) => {
            if let Some(boundary) = &boundary {
                close_boundary(boundary.as_ref()).await;
            }
            return Err(e.into());
        }
    };

    Ok(ContainerTask::assemble(
        deps,
        req,
        ContainerParts {
            isolation: plan.isolation,
            container,
            resources,
            boundary,
            owns_boundary: true,
        },
    ))
}

async fn provision_boundary(
    provisioner: &dyn BoundaryProvisioner,
    options: BoundaryOptions,
) -> Result<Arc<dyn Boundary>> {
    tracing::info!(%options, "provisioning boundary");
    let boundary = match options {
        BoundaryOptions::Linux(linux) => provisioner.create_linux(linux).await?,
        BoundaryOptions::Windows(mut windows) => {
            redirect_scratch(&mut windows).await?;
            provisioner.create_windows(windows).await?
        }
    };

    if let Err(e) = boundary.start().await {
        close_boundary(boundary.as_ref()).await;
        return Err(e.into());
    }
    Ok(boundary)
}

/// Points the boundary's scratch layer at a nested directory so it does not
/// collide with the container's own scratch.
async fn redirect_scratch(options: &mut WindowsBoundaryOptions) -> Result<()> {
    let Some(last) = options.layer_folders.last_mut() else {
        return Err(ShimError::Config {
            message: "windows boundary requires at least one layer folder".into(),
        });
    };
    let scratch = last.join(BOUNDARY_SCRATCH_DIR);
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| ShimError::Io {
            path: scratch.clone(),
            source: e,
        })?;
    *last = scratch;
    Ok(())
}

async fn close_boundary(boundary: &dyn Boundary) {
    match boundary.close().await {
        Ok(()) | Err(HandleError::AlreadyClosed) => {}
        Err(e) => tracing::error!(boundary = boundary.id(), error = %e, "failed to close boundary"),
    }
}

fn owner_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map_or_else(|| APP_NAME.to_owned(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use isoshim_common::config::ShimConfig;
    use isoshim_common::constants::SANDBOX_ID_ANNOTATION;
    use isoshim_common::types::StdioConfig;

    use super::*;
    use crate::events::Publisher;
    use crate::spec::{HypervSpec, WindowsNetwork, WindowsSpec};
    use crate::task::Task;
    use crate::testing::{CallLog, FakeEngine, FakeProvisioner, FakeReleaser, RecordingPublisher};

    fn windows_spec(layers: Vec<PathBuf>, hyperv: bool) -> RuntimeSpec {
        RuntimeSpec {
            windows: Some(WindowsSpec {
                layer_folders: layers,
                hyperv: hyperv.then(HypervSpec::default),
                network: Some(WindowsNetwork {
                    network_namespace: Some("ns-1".into()),
                }),
            }),
            ..RuntimeSpec::default()
        }
    }

    fn linux_spec() -> RuntimeSpec {
        RuntimeSpec {
            linux: Some(serde_json::json!({})),
            ..RuntimeSpec::default()
        }
    }

    struct Harness {
        log: CallLog,
        provisioner: Arc<FakeProvisioner>,
        engine: Arc<FakeEngine>,
        publisher: Arc<RecordingPublisher>,
        deps: Collaborators,
    }

    fn harness(provisioner: FakeProvisioner, engine: FakeEngine, log: CallLog) -> Harness {
        let provisioner = Arc::new(provisioner);
        let engine = Arc::new(engine);
        let publisher = Arc::new(RecordingPublisher::default());
        let deps = Collaborators {
            provisioner: Arc::clone(&provisioner) as Arc<dyn BoundaryProvisioner>,
            engine: Arc::clone(&engine) as _,
            releaser: Arc::new(FakeReleaser::new(log.clone())),
            publisher: Arc::clone(&publisher) as Arc<dyn Publisher>,
            config: ShimConfig::default(),
        };
        Harness {
            log,
            provisioner,
            engine,
            publisher,
            deps,
        }
    }

    fn request(spec: RuntimeSpec) -> CreateTaskRequest {
        CreateTaskRequest {
            id: TaskId::new("t1"),
            bundle: PathBuf::from("/run/bundles/t1"),
            rootfs: Vec::new(),
            stdio: StdioConfig::default(),
            spec,
        }
    }

    #[test]
    fn plan_rejects_pod_members() {
        let mut spec = windows_spec(vec![PathBuf::from("/l")], false);
        let _ = spec
            .annotations
            .insert(CONTAINER_TYPE_ANNOTATION.into(), "container".into());
        let _ = spec
            .annotations
            .insert(SANDBOX_ID_ANNOTATION.into(), "pod-1".into());

        let err = plan_task(&spec, &TaskId::new("t1"), "isoshim", true).unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn plan_rejects_unknown_sandbox_type() {
        let mut spec = linux_spec();
        let _ = spec
            .annotations
            .insert(CONTAINER_TYPE_ANNOTATION.into(), "vm".into());
        let err = plan_task(&spec, &TaskId::new("t1"), "isoshim", true).unwrap_err();
        assert!(matches!(err, ShimError::Config { .. }));
    }

    #[test]
    fn plan_rejects_linux_without_host_isolation() {
        let err = plan_task(&linux_spec(), &TaskId::new("t1"), "isoshim", false).unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn plan_for_process_isolated_windows() {
        let spec = windows_spec(vec![PathBuf::from("/l")], false);
        let plan = plan_task(&spec, &TaskId::new("t1"), "isoshim", true).unwrap();
        assert_eq!(plan.isolation, IsolationKind::Process);
        assert!(plan.boundary.is_none());
        assert_eq!(plan.network_namespace.as_deref(), Some("ns-1"));
    }

    #[test]
    fn plan_for_isolated_linux_names_boundary_after_task() {
        let plan = plan_task(&linux_spec(), &TaskId::new("t1"), "isoshim", true).unwrap();
        assert_eq!(plan.isolation, IsolationKind::HypervLinux);
        let Some(BoundaryOptions::Linux(options)) = plan.boundary else {
            panic!("expected linux boundary options");
        };
        assert_eq!(options.id, "t1@vm");
        assert_eq!(options.owner, "isoshim");
    }

    #[tokio::test]
    async fn process_isolated_task_skips_provisioning() {
        let log = CallLog::default();
        let h = harness(
            FakeProvisioner::new(log.clone()),
            FakeEngine::new(log.clone()),
            log,
        );
        let spec = windows_spec(vec![PathBuf::from("/l")], false);

        let task = new_standalone_task(&h.deps, request(spec)).await.unwrap();
        assert_eq!(task.isolation(), IsolationKind::Process);
        assert!(task.boundary().is_none());
        assert!(h.provisioner.created().is_empty());

        let containers = h.engine.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].0.network_namespace.as_deref(), Some("ns-1"));
        assert_eq!(h.publisher.topics(), ["/tasks/create"]);
    }

    #[tokio::test]
    async fn windows_boundary_scratch_is_redirected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let log = CallLog::default();
        let h = harness(
            FakeProvisioner::new(log.clone()),
            FakeEngine::new(log.clone()),
            log,
        );
        let spec = windows_spec(vec![base.clone(), scratch.clone()], true);

        let task = new_standalone_task(&h.deps, request(spec)).await.unwrap();
        assert_eq!(task.isolation(), IsolationKind::HypervWindows);
        assert!(task.owns_boundary());
        assert!(scratch.join("vm").is_dir());

        let created = h.provisioner.created();
        let [(BoundaryOptions::Windows(options), boundary)] = created.as_slice() else {
            panic!("expected one windows boundary");
        };
        assert_eq!(options.layer_folders, [base, scratch.join("vm")]);
        assert_eq!(boundary.start_count(), 1);
        assert_eq!(boundary.close_count(), 0);
    }

    #[tokio::test]
    async fn boundary_start_failure_closes_it() {
        let log = CallLog::default();
        let h = harness(
            FakeProvisioner::new(log.clone()).failing_start(),
            FakeEngine::new(log.clone()),
            log,
        );

        assert!(new_standalone_task(&h.deps, request(linux_spec())).await.is_err());
        let created = h.provisioner.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.close_count(), 1);
        assert!(h.engine.containers().is_empty());
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn container_failure_closes_started_boundary_once() {
        let log = CallLog::default();
        let h = harness(
            FakeProvisioner::new(log.clone()),
            FakeEngine::new(log.clone()).failing(),
            log,
        );

        let Err(err) = new_standalone_task(&h.deps, request(linux_spec())).await else {
            panic!("task creation succeeded without a container");
        };
        match err {
            ShimError::Backend { operation, message } => {
                assert_eq!(operation, "create container");
                assert_eq!(message, "injected failure");
            }
            other => panic!("unexpected error: {other}"),
        }

        let created = h.provisioner.created();
        assert_eq!(created[0].1.start_count(), 1);
        assert_eq!(created[0].1.close_count(), 1);
        assert_eq!(
            h.log.entries(),
            [
                "provisioner.create_linux(t1@vm)",
                "boundary.start(t1@vm)",
                "engine.create_container(t1)",
                "boundary.close(t1@vm)",
            ]
        );
    }

    #[tokio::test]
    async fn owned_boundary_closes_after_init_exit() {
        let log = CallLog::default();
        let h = harness(
            FakeProvisioner::new(log.clone()),
            FakeEngine::new(log.clone()),
            log,
        );

        let task = new_standalone_task(&h.deps, request(linux_spec())).await.unwrap();
        task.init().start().await.unwrap();
        task.kill_exec("", 15, false).await.unwrap();
        task.wait_for_teardown().await;

        let entries = h.log.entries();
        assert_eq!(entries.last().map(String::as_str), Some("boundary.close(t1@vm)"));
        assert_eq!(h.provisioner.created()[0].1.close_count(), 1);
    }
}
