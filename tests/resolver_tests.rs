//! Integration tests for PID-to-domain resolution.
//!
//! A fake container runtime and a temporary procfs tree drive the full
//! scan, refresh and resolve path of `CriPodFinder`.

use async_trait::async_trait;
use kubevirt_metrics_collector::cri::{ContainerRef, SandboxRef, DEFAULT_DOMAIN_ANNOTATION};
use kubevirt_metrics_collector::{
    CriPodFinder, InventoryOptions, PodFinder, ProcScanner, ResolveError, RuntimeClient,
    RuntimeError, RuntimeInventory, Target,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

const CONTAINER_ID: &str = "0c5a1f3e9d2b4c6a8e0f2d4b6a8c0e2f4d6b8a0c2e4f6d8b0a2c4e6f8d0b2a4c";

#[derive(Clone, Default)]
struct RuntimeState {
    containers: Vec<ContainerRef>,
    sandboxes: Vec<SandboxRef>,
    fail: bool,
}

#[derive(Clone, Default)]
struct FakeRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    fn set(&self, state: RuntimeState) {
        *self.state.lock().expect("runtime state lock") = state;
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_running_containers(&self) -> Result<Vec<ContainerRef>, RuntimeError> {
        let state = self.state.lock().expect("runtime state lock").clone();
        if state.fail {
            return Err(RuntimeError::RpcTimeout {
                method: "ListContainers",
                timeout: Duration::from_secs(10),
            });
        }
        Ok(state.containers)
    }

    async fn list_ready_sandboxes(&self) -> Result<Vec<SandboxRef>, RuntimeError> {
        Ok(self.state.lock().expect("runtime state lock").sandboxes.clone())
    }
}

fn write_process(root: &Path, pid: u32, argv: &[&str], cgroup: &str) {
    let dir = root.join(pid.to_string());
    std::fs::create_dir_all(&dir).expect("Failed to create pid dir");
    let mut cmdline = argv.join("\0");
    cmdline.push('\0');
    std::fs::write(dir.join("cmdline"), cmdline).expect("Failed to write cmdline");
    std::fs::write(dir.join("cgroup"), format!("{}\n", cgroup)).expect("Failed to write cgroup");
}

fn docker_cgroup(id: &str) -> String {
    format!("1:name=systemd:/docker-{}.scope", id)
}

fn sandbox(id: &str, name: &str, domain: Option<&str>) -> SandboxRef {
    let mut annotations = HashMap::new();
    if let Some(d) = domain {
        annotations.insert(DEFAULT_DOMAIN_ANNOTATION.to_string(), d.to_string());
    }
    SandboxRef {
        id: id.to_string(),
        name: name.to_string(),
        annotations,
    }
}

fn container(id: &str, sandbox: &str) -> ContainerRef {
    ContainerRef {
        id: id.to_string(),
        pod_sandbox_id: sandbox.to_string(),
    }
}

fn finder(runtime: &FakeRuntime, root: &Path, targets: &[Target]) -> CriPodFinder {
    let scanner = ProcScanner::new(targets).expect("patterns compile");
    let inventory = RuntimeInventory::with_client(
        Box::new(runtime.clone()),
        InventoryOptions {
            proc_root: root.to_path_buf(),
            ..Default::default()
        },
    );
    CriPodFinder::new(scanner, inventory)
}

fn init_target() -> Vec<Target> {
    vec![Target::new("init", vec!["/sbin/init".to_string()])]
}

// -----------------------------------------------------------------------------
// Domain naming
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_annotated_sandbox_yields_domain() {
    let dir = tempdir().expect("Failed to create temp dir");
    write_process(dir.path(), 1, &["/sbin/init"], &docker_cgroup(CONTAINER_ID));

    let runtime = FakeRuntime::default();
    runtime.set(RuntimeState {
        containers: vec![container(CONTAINER_ID, "sb-1")],
        sandboxes: vec![sandbox("sb-1", "virt-launcher-myvm-abcde", Some("myvm"))],
        fail: false,
    });

    let pods = finder(&runtime, dir.path(), &init_target())
        .find_pods()
        .await
        .expect("find_pods succeeds");

    assert_eq!(pods.len(), 1);
    let info = pods.get("myvm").expect("myvm domain present");
    let pids: Vec<u32> = info.processes.iter().map(|p| p.pid()).collect();
    assert_eq!(pids, vec![1]);
    assert_eq!(info.processes[0].name(), "init");
}

#[tokio::test]
async fn test_unannotated_sandbox_falls_back_to_name() {
    let dir = tempdir().expect("Failed to create temp dir");
    write_process(dir.path(), 1, &["/sbin/init"], &docker_cgroup(CONTAINER_ID));

    let runtime = FakeRuntime::default();
    runtime.set(RuntimeState {
        containers: vec![container(CONTAINER_ID, "sb-1")],
        sandboxes: vec![sandbox("sb-1", "myvm-pod", None)],
        fail: false,
    });

    let pods = finder(&runtime, dir.path(), &init_target())
        .find_pods()
        .await
        .expect("find_pods succeeds");

    assert_eq!(pods.keys().collect::<Vec<_>>(), vec!["myvm-pod"]);
}

// -----------------------------------------------------------------------------
// Misses
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_unresolvable_processes_are_dropped_and_counted() {
    let dir = tempdir().expect("Failed to create temp dir");
    let qemu = ["/usr/libexec/qemu-kvm", "-name", "guest"];
    // Resolves.
    write_process(dir.path(), 10, &qemu, &docker_cgroup(CONTAINER_ID));
    // Non-docker cgroup.
    write_process(dir.path(), 11, &qemu, "0::/kubepods.slice/crio-abc.scope");
    // Container unknown to the runtime.
    write_process(dir.path(), 12, &qemu, &docker_cgroup("feedface"));
    // Container whose sandbox is not ready.
    write_process(dir.path(), 13, &qemu, &docker_cgroup("deadbeef"));
    // Not a target at all.
    write_process(dir.path(), 14, &["/usr/bin/bash"], &docker_cgroup(CONTAINER_ID));

    let runtime = FakeRuntime::default();
    runtime.set(RuntimeState {
        containers: vec![container(CONTAINER_ID, "sb-1"), container("deadbeef", "sb-gone")],
        sandboxes: vec![sandbox("sb-1", "pod-a", Some("vm-a"))],
        fail: false,
    });

    let targets = vec![Target::new(
        "qemu",
        vec!["/usr/libexec/qemu-*".to_string(), "*".to_string(), "*".to_string()],
    )];
    let finder = finder(&runtime, dir.path(), &targets);
    let pods = finder.find_pods().await.expect("find_pods succeeds");

    assert_eq!(pods.len(), 1);
    assert_eq!(pods["vm-a"].processes.len(), 1);
    assert_eq!(pods["vm-a"].processes[0].pid(), 10);

    let misses: HashMap<&str, u64> = finder.miss_stats().snapshot().into_iter().collect();
    assert_eq!(misses["unsupported_cgroup"], 1);
    assert_eq!(misses["container_not_mapped"], 1);
    assert_eq!(misses["pod_not_mapped"], 1);
    assert_eq!(misses["process_gone"], 0);
}

#[tokio::test]
async fn test_find_pod_by_pid_uses_latest_tables() {
    let dir = tempdir().expect("Failed to create temp dir");
    write_process(dir.path(), 1, &["/sbin/init"], &docker_cgroup(CONTAINER_ID));

    let runtime = FakeRuntime::default();
    let finder = finder(&runtime, dir.path(), &init_target());

    // Nothing fetched yet.
    assert!(matches!(
        finder.find_pod_by_pid(1),
        Err(ResolveError::ContainerNotMapped { .. })
    ));

    runtime.set(RuntimeState {
        containers: vec![container(CONTAINER_ID, "sb-1")],
        sandboxes: vec![sandbox("sb-1", "pod", Some("myvm"))],
        fail: false,
    });
    finder.find_pods().await.expect("find_pods succeeds");
    assert_eq!(finder.find_pod_by_pid(1), Ok("myvm".to_string()));
    assert_eq!(
        finder.find_pod_by_pid(4242),
        Err(ResolveError::ProcessGone { pid: 4242 })
    );
}

#[tokio::test]
async fn test_runtime_failure_is_reported() {
    let dir = tempdir().expect("Failed to create temp dir");
    write_process(dir.path(), 1, &["/sbin/init"], &docker_cgroup(CONTAINER_ID));

    let runtime = FakeRuntime::default();
    runtime.set(RuntimeState {
        fail: true,
        ..Default::default()
    });

    let res = finder(&runtime, dir.path(), &init_target()).find_pods().await;
    assert!(res.is_err());
}
