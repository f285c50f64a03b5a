//! Process-related modules: discovery, cgroup classification and sampling.
//!
//! This module provides:
//! - `scanner`: argv-pattern based process discovery over procfs
//! - `cgroup`: container id extraction from `/proc/<pid>/cgroup`
//! - `cpu`: CPU time parsing from `/proc/<pid>/stat`
//! - `memory`: memory footprint parsing from `/proc/<pid>/statm`

pub mod cgroup;
pub mod cpu;
pub mod memory;
pub mod scanner;

use std::path::{Path, PathBuf};

// Re-export commonly used types
pub use cgroup::{classify, CgroupKind, Classification};
pub use cpu::{parse_cpu_times, CpuTimes, CLK_TCK};
pub use memory::{read_memory_info, MemoryInfo, PAGE_SIZE};
pub use scanner::{
    match_argv, PatternError, ProcScanner, ScanError, ScanResult, Target,
};

/// Process identifier as found in the procfs tree. PIDs are recycled by the
/// kernel, so a value is only meaningful at the time it was observed.
pub type Pid = u32;

/// Errors raised while sampling a single process.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected format in `{path}`")]
    Format { path: PathBuf },
    #[error("process {pid} has no command line (exited or kernel thread)")]
    NoCommandLine { pid: Pid },
}

/// Handle to a live process, used to sample its CPU and memory usage.
///
/// The handle does not keep the process alive: sampling fails once the
/// process has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    name: String,
    proc_path: PathBuf,
}

impl ProcessHandle {
    /// Opens a handle for `pid`, reading its command line to derive the
    /// process name (base name of `argv[0]`).
    pub fn open(proc_root: &Path, pid: Pid) -> Result<Self, SampleError> {
        let proc_path = proc_root.join(pid.to_string());
        let argv = scanner::read_proc_cmdline(&proc_path.join("cmdline"));
        let arg0 = argv.first().ok_or(SampleError::NoCommandLine { pid })?;
        Ok(Self {
            pid,
            name: scanner::base_name(arg0),
            proc_path,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_path
    }

    pub fn cpu_times(&self) -> Result<CpuTimes, SampleError> {
        parse_cpu_times(&self.proc_path)
    }

    pub fn memory_info(&self) -> Result<MemoryInfo, SampleError> {
        read_memory_info(&self.proc_path)
    }
}
