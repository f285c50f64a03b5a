//! Container identification from a process's cgroup membership.
//!
//! `/proc/<pid>/cgroup` records have the form
//! `<hierarchy-id>:<controller-list>:<cgroup-path>` (see cgroups(7)). Only the
//! first record is consulted; on hosts with several hierarchies that is the
//! first one in kernel order.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::process::scanner::base_name;
use crate::process::Pid;

const DOCKER_PREFIX: &str = "docker-";
const SCOPE_SUFFIX: &str = ".scope";

/// Naming convention of the cgroup a process was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CgroupKind {
    /// The cgroup file is absent or unreadable.
    Missing,
    /// The first record does not have exactly three fields.
    Malformed,
    /// A well-formed record with an unrecognised leaf name.
    Unknown,
    /// A `docker-<id>.scope` leaf.
    Docker,
}

impl fmt::Display for CgroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CgroupKind::Missing => "missing",
            CgroupKind::Malformed => "malformed",
            CgroupKind::Unknown => "unknown",
            CgroupKind::Docker => "docker",
        };
        f.write_str(s)
    }
}

/// Container identifier extracted from a cgroup record, with the kind of
/// record it came from. Only `Docker` ids are usable for pod mapping; other
/// kinds keep the raw leaf name for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub container_id: String,
    pub kind: CgroupKind,
}

impl Classification {
    fn new(container_id: impl Into<String>, kind: CgroupKind) -> Self {
        Self {
            container_id: container_id.into(),
            kind,
        }
    }

    fn missing() -> Self {
        Self::new(String::new(), CgroupKind::Missing)
    }

    fn malformed() -> Self {
        Self::new(String::new(), CgroupKind::Malformed)
    }
}

/// Classifies the cgroup of `pid` under the given procfs root.
pub fn classify(proc_root: &Path, pid: Pid) -> Classification {
    classify_file(&proc_root.join(pid.to_string()).join("cgroup"))
}

/// Classifies the first record of a cgroup membership file.
pub fn classify_file(path: &Path) -> Classification {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Classification::missing(),
    };

    let mut line = String::with_capacity(255);
    match BufReader::new(file).read_line(&mut line) {
        Ok(0) | Err(_) => Classification::missing(),
        Ok(_) => parse_cgroup_line(line.trim_end_matches(['\n', '\r'])),
    }
}

/// Classifies a single cgroup record.
pub fn parse_cgroup_line(line: &str) -> Classification {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 3 {
        return Classification::malformed();
    }

    let name = base_name(fields[2]);
    match name.strip_prefix(DOCKER_PREFIX) {
        Some(id) => {
            let id = id.strip_suffix(SCOPE_SUFFIX).unwrap_or(id);
            Classification::new(id, CgroupKind::Docker)
        }
        None => Classification::new(name, CgroupKind::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HEX_ID: &str = "6f2a1c9e07d4b1f3a5e8c0d2b4f6a8c0e2d4f6b8a0c2e4d6f8b0a2c4e6d8f0a2";

    #[test]
    fn test_docker_scope_line() {
        let c = parse_cgroup_line(&format!("1:name=systemd:/docker-{}.scope", HEX_ID));
        assert_eq!(c, Classification::new(HEX_ID, CgroupKind::Docker));
    }

    #[test]
    fn test_docker_nested_path_without_scope_suffix() {
        let line = format!(
            "0::/kubepods.slice/kubepods-burstable.slice/docker-{}",
            HEX_ID
        );
        let c = parse_cgroup_line(&line);
        assert_eq!(c.kind, CgroupKind::Docker);
        assert_eq!(c.container_id, HEX_ID);
    }

    #[test]
    fn test_root_cgroup_is_unknown() {
        let c = parse_cgroup_line("1:name=systemd:/");
        assert_eq!(c, Classification::new("/", CgroupKind::Unknown));
    }

    #[test]
    fn test_crio_scope_is_unknown_with_raw_name() {
        let c = parse_cgroup_line(&format!("0::/kubepods.slice/crio-{}.scope", HEX_ID));
        assert_eq!(c.kind, CgroupKind::Unknown);
        assert_eq!(c.container_id, format!("crio-{}.scope", HEX_ID));
    }

    #[test]
    fn test_malformed_lines() {
        for line in ["", "garbage", "1:cpu", "1:cpu:/a:/b"] {
            let c = parse_cgroup_line(line);
            assert_eq!(c.kind, CgroupKind::Malformed, "line {:?}", line);
            assert!(c.container_id.is_empty());
        }
    }

    #[test]
    fn test_classify_missing_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let c = classify(dir.path(), 4242);
        assert_eq!(c.kind, CgroupKind::Missing);
        assert!(c.container_id.is_empty());
    }

    #[test]
    fn test_classify_empty_file_is_missing() {
        let dir = tempdir().expect("Failed to create temp dir");
        let pid_dir = dir.path().join("10");
        std::fs::create_dir_all(&pid_dir).expect("Failed to create pid dir");
        std::fs::write(pid_dir.join("cgroup"), "").expect("Failed to write cgroup");
        assert_eq!(classify(dir.path(), 10).kind, CgroupKind::Missing);
    }

    #[test]
    fn test_classify_reads_only_first_line() {
        let dir = tempdir().expect("Failed to create temp dir");
        let pid_dir = dir.path().join("11");
        std::fs::create_dir_all(&pid_dir).expect("Failed to create pid dir");
        let content = format!(
            "12:memory:/docker-{}.scope\n11:cpu:/other-cgroup\n",
            HEX_ID
        );
        std::fs::write(pid_dir.join("cgroup"), content).expect("Failed to write cgroup");

        let c = classify(dir.path(), 11);
        assert_eq!(c, Classification::new(HEX_ID, CgroupKind::Docker));
    }
}
