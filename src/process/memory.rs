//! Memory parsing utilities for reading process memory metrics from /proc.
//!
//! All amounts come from `/proc/<pid>/statm`, which reports them in pages.

use once_cell::sync::Lazy;
use std::fs;
use std::path::Path;

use crate::process::SampleError;

fn get_page_size() -> u64 {
    // SAFETY: sysconf is safe to call with _SC_PAGESIZE
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// System page size in bytes.
pub static PAGE_SIZE: Lazy<u64> = Lazy::new(get_page_size);

/// Memory footprint of a process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    /// Resident pages backed by files or shared memory.
    pub shared_bytes: u64,
    /// Always zero since Linux 2.6.
    pub dirty_bytes: u64,
}

impl MemoryInfo {
    /// `(type label, bytes)` pairs in export order.
    pub fn amounts(&self) -> [(&'static str, u64); 4] {
        [
            ("virtual", self.virtual_bytes),
            ("resident", self.resident_bytes),
            ("shared", self.shared_bytes),
            ("dirty", self.dirty_bytes),
        ]
    }
}

/// Reads the memory footprint from `<proc_path>/statm`.
///
/// Kernel threads have no address space and report zeroes.
pub fn read_memory_info(proc_path: &Path) -> Result<MemoryInfo, SampleError> {
    let statm_path = proc_path.join("statm");
    let content = fs::read_to_string(&statm_path).map_err(|source| SampleError::Read {
        path: statm_path.clone(),
        source,
    })?;
    parse_statm(&content, *PAGE_SIZE).ok_or(SampleError::Format { path: statm_path })
}

/// Parses `size resident shared text lib data dt`.
fn parse_statm(content: &str, page_size: u64) -> Option<MemoryInfo> {
    let pages: Vec<u64> = content
        .split_whitespace()
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    if pages.len() < 7 {
        return None;
    }

    Some(MemoryInfo {
        virtual_bytes: pages[0] * page_size,
        resident_bytes: pages[1] * page_size,
        shared_bytes: pages[2] * page_size,
        dirty_bytes: pages[6] * page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_memory_info() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("statm"), "875000 131072 2048 600 0 90000 0\n")
            .expect("Failed to write statm");

        let info = read_memory_info(dir.path()).expect("valid statm");
        assert_eq!(info.virtual_bytes, 875_000 * *PAGE_SIZE);
        assert_eq!(info.resident_bytes, 131_072 * *PAGE_SIZE);
        assert_eq!(info.shared_bytes, 2048 * *PAGE_SIZE);
        assert_eq!(info.dirty_bytes, 0);
    }

    #[test]
    fn test_kernel_thread_reports_zeroes() {
        let info = parse_statm("0 0 0 0 0 0 0", 4096).expect("valid statm");
        assert_eq!(info, MemoryInfo::default());
    }

    #[test]
    fn test_parse_statm_rejects_garbage() {
        assert_eq!(parse_statm("", 4096), None);
        assert_eq!(parse_statm("1 2 3", 4096), None);
        assert_eq!(parse_statm("1 2 x 4 5 6 7", 4096), None);
    }

    #[test]
    fn test_read_memory_info_garbage_value() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("statm"), "lots\n").expect("Failed to write statm");

        let err = read_memory_info(dir.path()).unwrap_err();
        assert!(matches!(err, SampleError::Format { .. }));
    }

    #[test]
    fn test_amounts_order() {
        let info = MemoryInfo {
            virtual_bytes: 4,
            resident_bytes: 3,
            shared_bytes: 2,
            dirty_bytes: 1,
        };
        let labels: Vec<&str> = info.amounts().iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec!["virtual", "resident", "shared", "dirty"]);
    }
}
