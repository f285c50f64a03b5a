//! CPU statistics parsing for process metrics.
//!
//! This module parses user and system CPU time from `/proc/<pid>/stat`.

use once_cell::sync::Lazy;
use std::fs;
use std::path::Path;

use crate::process::SampleError;

/// Get system clock ticks per second (usually 100, but can vary).
fn get_clk_tck() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is safe to call with _SC_CLK_TCK
        // Returns -1 on error, 0 if undefined - both are handled by the > 0 check
        unsafe {
            let tck = libc::sysconf(libc::_SC_CLK_TCK);
            if tck > 0 {
                return tck as f64;
            }
        }
    }
    // Fallback to common default for error cases or non-Unix platforms
    100.0
}

/// System clock ticks per second (for CPU time calculation).
pub static CLK_TCK: Lazy<f64> = Lazy::new(get_clk_tck);

/// Cumulative CPU time of a process, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub user_seconds: f64,
    pub system_seconds: f64,
}

/// Parse user and system CPU time from `<proc_path>/stat`.
pub fn parse_cpu_times(proc_path: &Path) -> Result<CpuTimes, SampleError> {
    let stat_path = proc_path.join("stat");
    let content = fs::read_to_string(&stat_path).map_err(|source| SampleError::Read {
        path: stat_path.clone(),
        source,
    })?;
    parse_cpu_times_from_stat(&content).ok_or(SampleError::Format { path: stat_path })
}

/// Extracts utime/stime (fields 14 and 15) from a stat line.
///
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last `)`.
fn parse_cpu_times_from_stat(content: &str) -> Option<CpuTimes> {
    let after_comm = &content[content.rfind(')')? + 1..];
    // after_comm starts at field 3 (state); utime is field 14
    let parts: Vec<&str> = after_comm.split_whitespace().collect();
    if parts.len() <= 12 {
        return None;
    }

    let utime: f64 = parts[11].parse().ok()?;
    let stime: f64 = parts[12].parse().ok()?;

    Some(CpuTimes {
        user_seconds: utime / *CLK_TCK,
        system_seconds: stime / *CLK_TCK,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // -------------------------------------------------------------------------
    // Tests for parse_cpu_times
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_cpu_times() {
        let dir = tempdir().expect("Failed to create temp dir");
        let stat_path = dir.path().join("stat");

        // Example: utime=1000, stime=500
        let stat_content = "1234 (test_process) S 1 1234 1234 0 -1 4194304 100 0 0 0 1000 500 0 0 20 0 1 0 12345 12345678 1234 18446744073709551615 4194304 4238788 140736466511168 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0";
        std::fs::write(&stat_path, stat_content).expect("Failed to write stat file");

        let times = parse_cpu_times(dir.path()).expect("valid stat");
        assert!((times.user_seconds - 1000.0 / *CLK_TCK).abs() < 0.001);
        assert!((times.system_seconds - 500.0 / *CLK_TCK).abs() < 0.001);
    }

    #[test]
    fn test_parse_cpu_times_comm_with_spaces() {
        let dir = tempdir().expect("Failed to create temp dir");
        let stat_content = "77 (qemu (vm) x) S 1 77 77 0 -1 4194304 100 0 0 0 300 200 0 0 20 0 1 0 12345 12345678 1234";
        std::fs::write(dir.path().join("stat"), stat_content).expect("Failed to write stat file");

        let times = parse_cpu_times(dir.path()).expect("valid stat");
        assert!((times.user_seconds - 300.0 / *CLK_TCK).abs() < 0.001);
        assert!((times.system_seconds - 200.0 / *CLK_TCK).abs() < 0.001);
    }

    #[test]
    fn test_parse_cpu_times_invalid_stat() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("stat"), "1234 (test) S 1 2 3")
            .expect("Failed to write stat file");

        let err = parse_cpu_times(dir.path()).unwrap_err();
        assert!(matches!(err, SampleError::Format { .. }));
    }

    #[test]
    fn test_parse_cpu_times_missing_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let err = parse_cpu_times(dir.path()).unwrap_err();
        assert!(matches!(err, SampleError::Read { .. }));
    }
}
