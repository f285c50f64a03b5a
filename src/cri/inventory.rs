//! Container -> pod -> domain lookup tables built from the container runtime.
//!
//! The two tables are only useful together: a PID is resolved by mapping its
//! cgroup container id to a pod sandbox, then the sandbox to a domain name.
//! Both are rebuilt on every refresh and published as one [`Tables`] value,
//! so a lookup always sees a container table and a pod table of the same
//! generation.

use ahash::AHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::cri::{GrpcRuntimeClient, RuntimeClient, RuntimeError, SandboxRef};
use crate::process::{cgroup, CgroupKind, Pid};

/// Annotation KubeVirt sets on virt-launcher pods with the VM name.
pub const DEFAULT_DOMAIN_ANNOTATION: &str = "kubevirt.io/domain";

/// Why a PID could not be mapped to a domain. Every variant is an expected
/// outcome under normal churn, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("process {pid} has unsupported cgroup kind `{kind}` ({container_id:?})")]
    UnsupportedCgroupKind {
        pid: Pid,
        kind: CgroupKind,
        container_id: String,
    },
    #[error("process {pid}: container {container_id} is not a running container")]
    ContainerNotMapped { pid: Pid, container_id: String },
    #[error("process {pid}: pod sandbox {sandbox_id} is not a ready pod")]
    PodNotMapped { pid: Pid, sandbox_id: String },
    #[error("process {pid} exited")]
    ProcessGone { pid: Pid },
}

impl ResolveError {
    /// Every value [`ResolveError::reason`] can return, indexed by
    /// [`ResolveError::index`].
    pub const REASONS: [&'static str; 4] = [
        "unsupported_cgroup",
        "container_not_mapped",
        "pod_not_mapped",
        "process_gone",
    ];

    /// Position of this variant in [`ResolveError::REASONS`].
    pub fn index(&self) -> usize {
        match self {
            ResolveError::UnsupportedCgroupKind { .. } => 0,
            ResolveError::ContainerNotMapped { .. } => 1,
            ResolveError::PodNotMapped { .. } => 2,
            ResolveError::ProcessGone { .. } => 3,
        }
    }

    /// Short label value used when counting misses.
    pub fn reason(&self) -> &'static str {
        Self::REASONS[self.index()]
    }
}

/// One generation of the container and pod tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    /// container id -> pod sandbox id
    containers: HashMap<String, String>,
    /// pod sandbox id -> domain name
    pods: HashMap<String, String>,
}

impl Tables {
    pub fn new(containers: HashMap<String, String>, pods: HashMap<String, String>) -> Self {
        Self { containers, pods }
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn sandbox_for_container(&self, container_id: &str) -> Option<&str> {
        self.containers.get(container_id).map(String::as_str)
    }

    pub fn domain_for_sandbox(&self, sandbox_id: &str) -> Option<&str> {
        self.pods.get(sandbox_id).map(String::as_str)
    }

    /// Resolves the domain of `pid` through its cgroup and these tables.
    pub fn find_pod_by_pid(&self, proc_root: &Path, pid: Pid) -> Result<String, ResolveError> {
        let class = cgroup::classify(proc_root, pid);
        match class.kind {
            CgroupKind::Docker => {}
            // The cgroup file disappears together with the process.
            CgroupKind::Missing => return Err(ResolveError::ProcessGone { pid }),
            kind => {
                return Err(ResolveError::UnsupportedCgroupKind {
                    pid,
                    kind,
                    container_id: class.container_id,
                })
            }
        }

        let sandbox_id = self.sandbox_for_container(&class.container_id).ok_or_else(|| {
            ResolveError::ContainerNotMapped {
                pid,
                container_id: class.container_id.clone(),
            }
        })?;

        self.domain_for_sandbox(sandbox_id)
            .map(str::to_string)
            .ok_or_else(|| ResolveError::PodNotMapped {
                pid,
                sandbox_id: sandbox_id.to_string(),
            })
    }
}

/// Settings that shape how runtime state is interpreted.
#[derive(Debug, Clone)]
pub struct InventoryOptions {
    pub domain_annotation: String,
    pub proc_root: PathBuf,
    /// Log both tables at debug level after each refresh.
    pub debug: bool,
}

impl Default for InventoryOptions {
    fn default() -> Self {
        Self {
            domain_annotation: DEFAULT_DOMAIN_ANNOTATION.to_string(),
            proc_root: PathBuf::from("/proc"),
            debug: false,
        }
    }
}

/// Refreshable view of the container runtime's running containers and ready
/// pod sandboxes.
pub struct RuntimeInventory {
    client: Box<dyn RuntimeClient>,
    options: InventoryOptions,
    tables: RwLock<Arc<Tables>>,
}

impl std::fmt::Debug for RuntimeInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInventory")
            .field("options", &self.options)
            .field("tables", &self.tables())
            .finish()
    }
}

impl RuntimeInventory {
    /// Connects to the runtime at `endpoint`. A dial failure is returned to
    /// the caller, which decides whether to run degraded.
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        options: InventoryOptions,
    ) -> Result<Self, RuntimeError> {
        let client = GrpcRuntimeClient::connect(endpoint, connect_timeout, request_timeout).await?;
        Ok(Self::with_client(Box::new(client), options))
    }

    /// Builds an inventory over an arbitrary client, starting with empty
    /// tables.
    pub fn with_client(client: Box<dyn RuntimeClient>, options: InventoryOptions) -> Self {
        Self {
            client,
            options,
            tables: RwLock::new(Arc::new(Tables::default())),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.options.proc_root
    }

    /// Current table generation. The returned snapshot is unaffected by later
    /// refreshes.
    pub fn tables(&self) -> Arc<Tables> {
        let guard = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Re-lists containers and sandboxes and publishes both tables together.
    /// On failure the previous generation stays in place.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), RuntimeError> {
        let containers = self.update_containers().await?;
        let pods = self.update_pods().await?;

        if self.options.debug {
            for (container, sandbox) in &containers {
                debug!("container {} -> pod {}", container, sandbox);
            }
            for (sandbox, domain) in &pods {
                debug!("pod {} -> domain {}", sandbox, domain);
            }
        }
        debug!(
            "Runtime inventory refreshed: {} containers, {} pods",
            containers.len(),
            pods.len()
        );

        let fresh = Arc::new(Tables::new(containers, pods));
        *self.tables.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    /// Resolves `pid` against the current table generation.
    pub fn find_pod_by_pid(&self, pid: Pid) -> Result<String, ResolveError> {
        self.tables().find_pod_by_pid(&self.options.proc_root, pid)
    }

    async fn update_containers(&self) -> Result<HashMap<String, String>, RuntimeError> {
        let containers = self.client.list_running_containers().await?;
        Ok(containers
            .into_iter()
            .map(|c| (c.id, c.pod_sandbox_id))
            .collect())
    }

    async fn update_pods(&self) -> Result<HashMap<String, String>, RuntimeError> {
        let sandboxes = self.client.list_ready_sandboxes().await?;
        let mut pods = HashMap::with_capacity(sandboxes.len());
        for sandbox in sandboxes {
            match domain_name(&sandbox, &self.options.domain_annotation) {
                Some(domain) => {
                    pods.insert(sandbox.id, domain);
                }
                None => debug!("Skipping pod sandbox {} without name or domain", sandbox.id),
            }
        }
        Ok(pods)
    }
}

/// Domain of a sandbox: the annotation when set, else the sandbox name.
fn domain_name(sandbox: &SandboxRef, annotation: &str) -> Option<String> {
    sandbox
        .annotations
        .get(annotation)
        .filter(|v| !v.is_empty())
        .or_else(|| Some(&sandbox.name).filter(|n| !n.is_empty()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::ContainerRef;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct FakeRuntime {
        containers: Vec<ContainerRef>,
        sandboxes: Vec<SandboxRef>,
        fail_pods: AtomicBool,
    }

    #[async_trait]
    impl RuntimeClient for FakeRuntime {
        async fn list_running_containers(&self) -> Result<Vec<ContainerRef>, RuntimeError> {
            Ok(self.containers.clone())
        }

        async fn list_ready_sandboxes(&self) -> Result<Vec<SandboxRef>, RuntimeError> {
            if self.fail_pods.load(Ordering::SeqCst) {
                return Err(RuntimeError::RpcTimeout {
                    method: "ListPodSandbox",
                    timeout: Duration::from_secs(10),
                });
            }
            Ok(self.sandboxes.clone())
        }
    }

    fn sandbox(id: &str, name: &str, domain: Option<&str>) -> SandboxRef {
        let mut annotations = std::collections::HashMap::new();
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

    fn write_cgroup(root: &Path, pid: Pid, line: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).expect("Failed to create pid dir");
        std::fs::write(dir.join("cgroup"), format!("{}\n", line)).expect("Failed to write cgroup");
    }

    fn inventory(runtime: FakeRuntime, proc_root: &Path) -> RuntimeInventory {
        RuntimeInventory::with_client(
            Box::new(runtime),
            InventoryOptions {
                proc_root: proc_root.to_path_buf(),
                ..Default::default()
            },
        )
    }

    // -------------------------------------------------------------------------
    // Table construction
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_refresh_builds_both_tables() {
        let dir = tempdir().expect("Failed to create temp dir");
        let inv = inventory(
            FakeRuntime {
                containers: vec![container("c1", "sb1"), container("c2", "sb2")],
                sandboxes: vec![
                    sandbox("sb1", "virt-launcher-a", Some("vm-a")),
                    sandbox("sb2", "myvm-pod", None),
                ],
                fail_pods: AtomicBool::new(false),
            },
            dir.path(),
        );

        inv.refresh().await.expect("refresh succeeds");
        let tables = inv.tables();
        assert_eq!(tables.container_count(), 2);
        assert_eq!(tables.sandbox_for_container("c1"), Some("sb1"));
        assert_eq!(tables.domain_for_sandbox("sb1"), Some("vm-a"));
        assert_eq!(tables.domain_for_sandbox("sb2"), Some("myvm-pod"));
    }

    #[tokio::test]
    async fn test_sandbox_without_name_or_annotation_is_skipped() {
        let dir = tempdir().expect("Failed to create temp dir");
        let inv = inventory(
            FakeRuntime {
                containers: vec![],
                sandboxes: vec![sandbox("sb1", "", None), sandbox("sb2", "", Some("vm-b"))],
                fail_pods: AtomicBool::new(false),
            },
            dir.path(),
        );

        inv.refresh().await.expect("refresh succeeds");
        assert_eq!(inv.tables().pod_count(), 1);
        assert_eq!(inv.tables().domain_for_sandbox("sb2"), Some("vm-b"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_generation() {
        let dir = tempdir().expect("Failed to create temp dir");
        let runtime = FakeRuntime {
            containers: vec![container("c1", "sb1")],
            sandboxes: vec![sandbox("sb1", "pod", Some("vm"))],
            fail_pods: AtomicBool::new(false),
        };
        let inv = inventory(runtime, dir.path());
        inv.refresh().await.expect("first refresh succeeds");
        let before = inv.tables();

        // Swap in a client whose pod listing fails: containers would list
        // fine, but neither table may be replaced.
        let failing = RuntimeInventory::with_client(
            Box::new(FakeRuntime {
                containers: vec![container("c9", "sb9")],
                sandboxes: vec![],
                fail_pods: AtomicBool::new(true),
            }),
            InventoryOptions::default(),
        );
        *failing.tables.write().unwrap() = Arc::clone(&before);

        assert!(failing.refresh().await.is_err());
        assert_eq!(*failing.tables(), *before);
        assert_eq!(failing.tables().sandbox_for_container("c9"), None);
    }

    // -------------------------------------------------------------------------
    // PID resolution
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_find_pod_by_pid() {
        let dir = tempdir().expect("Failed to create temp dir");
        write_cgroup(dir.path(), 1, "1:name=systemd:/docker-c1.scope");
        write_cgroup(dir.path(), 2, "1:name=systemd:/docker-c7.scope");
        write_cgroup(dir.path(), 3, "1:name=systemd:/docker-c3.scope");
        write_cgroup(dir.path(), 4, "1:name=systemd:/user.slice");
        write_cgroup(dir.path(), 5, "garbage");

        let inv = inventory(
            FakeRuntime {
                containers: vec![container("c1", "sb1"), container("c3", "sb-gone")],
                sandboxes: vec![sandbox("sb1", "pod", Some("myvm"))],
                fail_pods: AtomicBool::new(false),
            },
            dir.path(),
        );
        inv.refresh().await.expect("refresh succeeds");

        assert_eq!(inv.find_pod_by_pid(1), Ok("myvm".to_string()));
        assert!(matches!(
            inv.find_pod_by_pid(2),
            Err(ResolveError::ContainerNotMapped { pid: 2, .. })
        ));
        assert!(matches!(
            inv.find_pod_by_pid(3),
            Err(ResolveError::PodNotMapped { pid: 3, .. })
        ));
        assert!(matches!(
            inv.find_pod_by_pid(4),
            Err(ResolveError::UnsupportedCgroupKind {
                kind: CgroupKind::Unknown,
                ..
            })
        ));
        assert!(matches!(
            inv.find_pod_by_pid(5),
            Err(ResolveError::UnsupportedCgroupKind {
                kind: CgroupKind::Malformed,
                ..
            })
        ));
        assert_eq!(
            inv.find_pod_by_pid(6),
            Err(ResolveError::ProcessGone { pid: 6 })
        );
    }

    #[test]
    fn test_reasons_follow_variant_index() {
        let errors = [
            ResolveError::UnsupportedCgroupKind {
                pid: 1,
                kind: CgroupKind::Unknown,
                container_id: "/".into(),
            },
            ResolveError::ContainerNotMapped {
                pid: 1,
                container_id: "c".into(),
            },
            ResolveError::PodNotMapped {
                pid: 1,
                sandbox_id: "x".into(),
            },
            ResolveError::ProcessGone { pid: 1 },
        ];
        for (i, e) in errors.iter().enumerate() {
            assert_eq!(e.index(), i);
            assert_eq!(e.reason(), ResolveError::REASONS[i]);
        }
    }

    #[test]
    fn test_missing_cgroup_file_means_process_gone() {
        // No /proc/<pid>/cgroup: the process exited between scan and
        // resolve, which is not an unsupported cgroup layout.
        let dir = tempdir().expect("Failed to create temp dir");
        let tables = Tables::default();

        assert_eq!(
            tables.find_pod_by_pid(dir.path(), 77),
            Err(ResolveError::ProcessGone { pid: 77 })
        );
    }
}
