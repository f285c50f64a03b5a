//! Pod discovery: which monitored processes belong to which domain.
//!
//! A [`PodFinder`] produces a [`PodInfoMap`] (domain name -> processes). The
//! CRI-backed finder combines a procfs scan with the runtime inventory; the
//! self and null finders serve the dump mode and degraded operation.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cri::{RuntimeError, RuntimeInventory, Tables};
use crate::process::{Pid, ProcScanner, ProcessHandle, ScanError, ScanResult};

pub use crate::cri::ResolveError;

/// Domain name the self finder reports its own process under.
pub const SELF_DOMAIN: &str = "self";

/// Processes found for one domain. Never mutated once published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub processes: Vec<ProcessHandle>,
}

/// Domain name -> processes of that domain.
pub type PodInfoMap = HashMap<String, Arc<PodInfo>>;

/// Errors that prevent a pod map from being produced at all.
#[derive(Debug, thiserror::Error)]
pub enum FindError {
    #[error("process scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("container runtime refresh failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("process scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Source of the domain -> processes mapping.
#[async_trait]
pub trait PodFinder: Send + Sync {
    /// Builds a complete, fresh pod map.
    async fn find_pods(&self) -> Result<PodInfoMap, FindError>;

    /// Resolves the domain of a single process.
    fn find_pod_by_pid(&self, pid: Pid) -> Result<String, ResolveError>;
}

/// Running count of processes dropped during resolution, by reason.
#[derive(Debug, Default)]
pub struct MissStats {
    counts: [AtomicU64; 4],
}

impl MissStats {
    pub fn record(&self, miss: &ResolveError) {
        self.counts[miss.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Totals as `(reason, count)` pairs in [`ResolveError::REASONS`] order.
    pub fn snapshot(&self) -> [(&'static str, u64); 4] {
        std::array::from_fn(|i| {
            (
                ResolveError::REASONS[i],
                self.counts[i].load(Ordering::Relaxed),
            )
        })
    }

    pub fn total(&self) -> u64 {
        self.snapshot().iter().map(|(_, n)| n).sum()
    }
}

/// Groups scanned PIDs by domain using one table generation. PIDs that fail
/// to resolve, or exit before a handle can be opened, are counted and
/// dropped.
pub fn map_procs_to_pods(
    scan: &ScanResult,
    tables: &Tables,
    proc_root: &Path,
    misses: &MissStats,
) -> PodInfoMap {
    let mut grouped: HashMap<String, Vec<ProcessHandle>> = HashMap::new();

    for (target, pids) in scan {
        for &pid in pids {
            let domain = match tables.find_pod_by_pid(proc_root, pid) {
                Ok(domain) => domain,
                Err(miss) => {
                    debug!("Skipping {} process {}: {}", target, pid, miss);
                    misses.record(&miss);
                    continue;
                }
            };

            match ProcessHandle::open(proc_root, pid) {
                Ok(handle) => {
                    debug!("Process {} ({}) belongs to domain {}", pid, target, domain);
                    grouped.entry(domain).or_default().push(handle);
                }
                Err(e) => {
                    debug!("Skipping {} process {}: {}", target, pid, e);
                    misses.record(&ResolveError::ProcessGone { pid });
                }
            }
        }
    }

    grouped
        .into_iter()
        .map(|(domain, mut processes)| {
            processes.sort_by_key(ProcessHandle::pid);
            (domain, Arc::new(PodInfo { processes }))
        })
        .collect()
}

/// Finder backed by a procfs scan and the container runtime inventory.
#[derive(Debug)]
pub struct CriPodFinder {
    scanner: Arc<ProcScanner>,
    inventory: RuntimeInventory,
    proc_root: PathBuf,
    misses: Arc<MissStats>,
}

impl CriPodFinder {
    pub fn new(scanner: ProcScanner, inventory: RuntimeInventory) -> Self {
        let proc_root = inventory.proc_root().to_path_buf();
        Self {
            scanner: Arc::new(scanner),
            inventory,
            proc_root,
            misses: Arc::new(MissStats::default()),
        }
    }

    /// Counters shared with whoever exports them.
    pub fn miss_stats(&self) -> Arc<MissStats> {
        Arc::clone(&self.misses)
    }
}

#[async_trait]
impl PodFinder for CriPodFinder {
    #[instrument(skip(self))]
    async fn find_pods(&self) -> Result<PodInfoMap, FindError> {
        let start = Instant::now();

        let scanner = Arc::clone(&self.scanner);
        let root = self.proc_root.clone();
        let scan = tokio::task::spawn_blocking(move || scanner.scan(&root)).await??;
        debug!(
            "Scan found {} processes across {} targets",
            scan.values().map(Vec::len).sum::<usize>(),
            scan.len()
        );

        // Never resolve a fresh scan against stale runtime tables.
        if let Err(e) = self.inventory.refresh().await {
            warn!("Container runtime refresh failed: {}", e);
            return Err(e.into());
        }

        let tables = self.inventory.tables();
        let root = self.proc_root.clone();
        let misses = Arc::clone(&self.misses);
        let pods = tokio::task::spawn_blocking(move || {
            map_procs_to_pods(&scan, &tables, &root, &misses)
        })
        .await?;

        debug!(
            "Resolved {} domains in {:.3}s",
            pods.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(pods)
    }

    fn find_pod_by_pid(&self, pid: Pid) -> Result<String, ResolveError> {
        self.inventory.find_pod_by_pid(pid)
    }
}

/// Finder that reports only the agent's own process, under domain
/// [`SELF_DOMAIN`]. Needs no container runtime.
#[derive(Debug, Clone)]
pub struct SelfPodFinder {
    proc_root: PathBuf,
    pid: Pid,
}

impl SelfPodFinder {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            pid: std::process::id(),
        }
    }
}

#[async_trait]
impl PodFinder for SelfPodFinder {
    async fn find_pods(&self) -> Result<PodInfoMap, FindError> {
        let mut pods = PodInfoMap::new();
        match ProcessHandle::open(&self.proc_root, self.pid) {
            Ok(handle) => {
                pods.insert(
                    SELF_DOMAIN.to_string(),
                    Arc::new(PodInfo {
                        processes: vec![handle],
                    }),
                );
            }
            Err(e) => warn!("Cannot open own process {}: {}", self.pid, e),
        }
        Ok(pods)
    }

    fn find_pod_by_pid(&self, pid: Pid) -> Result<String, ResolveError> {
        if pid == self.pid {
            Ok(SELF_DOMAIN.to_string())
        } else {
            Err(ResolveError::ContainerNotMapped {
                pid,
                container_id: String::new(),
            })
        }
    }
}

/// Finder that never finds anything. Used when the agent runs without a
/// container runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPodFinder;

#[async_trait]
impl PodFinder for NullPodFinder {
    async fn find_pods(&self) -> Result<PodInfoMap, FindError> {
        Ok(PodInfoMap::new())
    }

    fn find_pod_by_pid(&self, pid: Pid) -> Result<String, ResolveError> {
        Err(ResolveError::ContainerNotMapped {
            pid,
            container_id: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_proc(root: &Path, pid: Pid, cmdline: &str, cgroup: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).expect("Failed to create pid dir");
        std::fs::write(dir.join("cmdline"), cmdline.replace(' ', "\0"))
            .expect("Failed to write cmdline");
        std::fs::write(dir.join("cgroup"), format!("{}\n", cgroup))
            .expect("Failed to write cgroup");
    }

    fn tables(containers: &[(&str, &str)], pods: &[(&str, &str)]) -> Tables {
        Tables::new(
            containers
                .iter()
                .map(|(c, s)| (c.to_string(), s.to_string()))
                .collect(),
            pods.iter()
                .map(|(s, d)| (s.to_string(), d.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_map_procs_groups_by_domain() {
        let dir = tempdir().expect("Failed to create temp dir");
        write_proc(dir.path(), 10, "/usr/bin/qemu-kvm -name a", "1:cpu:/docker-c1.scope");
        write_proc(dir.path(), 11, "/usr/bin/virt-launcher", "1:cpu:/docker-c1.scope");
        write_proc(dir.path(), 20, "/usr/bin/qemu-kvm -name b", "1:cpu:/docker-c2.scope");
        write_proc(dir.path(), 30, "/usr/bin/qemu-kvm -name c", "1:cpu:/system.slice");

        let mut scan = ScanResult::new();
        scan.insert("qemu".to_string(), vec![10, 20, 30]);
        scan.insert("launcher".to_string(), vec![11]);

        let t = tables(&[("c1", "sb1"), ("c2", "sb2")], &[("sb1", "vm-a"), ("sb2", "vm-b")]);
        let misses = MissStats::default();
        let pods = map_procs_to_pods(&scan, &t, dir.path(), &misses);

        assert_eq!(pods.len(), 2);
        let a: Vec<Pid> = pods["vm-a"].processes.iter().map(|p| p.pid()).collect();
        assert_eq!(a, vec![10, 11]);
        assert_eq!(pods["vm-b"].processes[0].name(), "qemu-kvm");
        assert_eq!(misses.total(), 1);
        assert_eq!(misses.snapshot()[0], ("unsupported_cgroup", 1));
    }

    #[test]
    fn test_map_procs_drops_exited_process() {
        let dir = tempdir().expect("Failed to create temp dir");
        // cgroup still readable but argv gone: a zombie on its way out
        write_proc(dir.path(), 10, "", "1:cpu:/docker-c1.scope");

        let mut scan = ScanResult::new();
        scan.insert("qemu".to_string(), vec![10, 11]);
        let t = tables(&[("c1", "sb1")], &[("sb1", "vm-a")]);
        let misses = MissStats::default();

        let pods = map_procs_to_pods(&scan, &t, dir.path(), &misses);
        assert!(pods.is_empty());
        assert_eq!(misses.snapshot()[3], ("process_gone", 2));
    }

    #[tokio::test]
    async fn test_self_finder_reports_own_process() {
        let finder = SelfPodFinder::new("/proc");
        let pods = finder.find_pods().await.expect("self finder never fails");

        let info = pods.get(SELF_DOMAIN).expect("own process is found");
        assert_eq!(info.processes.len(), 1);
        assert_eq!(info.processes[0].pid(), std::process::id());
        assert_eq!(
            finder.find_pod_by_pid(std::process::id()),
            Ok(SELF_DOMAIN.to_string())
        );
        assert!(finder.find_pod_by_pid(1).is_err());
    }

    #[tokio::test]
    async fn test_null_finder_is_empty() {
        let pods = NullPodFinder.find_pods().await.expect("null finder never fails");
        assert!(pods.is_empty());
        assert_eq!(
            NullPodFinder.find_pod_by_pid(1).unwrap_err().reason(),
            "container_not_mapped"
        );
    }
}
