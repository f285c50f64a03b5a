//! Process scanning utilities for discovering target processes in /proc.
//!
//! The scanner walks the live process table, reads each process's argument
//! vector and assigns the PID to the first configured [`Target`] whose argv
//! pattern matches. Entries that vanish or cannot be read while the walk is in
//! progress are skipped silently: a process exiting mid-scan is not an error.

use ahash::AHashMap as HashMap;
use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::process::Pid;

/// Glob options equivalent to shell pathname matching: `*` and `?` never
/// cross a `/`.
const ARGV_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Result of a scan: target name -> PIDs of its live instances.
pub type ScanResult = HashMap<String, Vec<Pid>>;

/// Errors raised when the process table itself cannot be enumerated.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to list process table at `{path}`: {source}")]
    ListProcRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A target argv element that is not a valid shell glob.
#[derive(Debug, thiserror::Error)]
#[error("invalid argv pattern `{pattern}`: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: glob::PatternError,
}

/// A process-matching rule: a user-visible name and an argv glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Name reported for matching processes. Defaults to the base name of
    /// `argv[0]` when empty.
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(alias = "Argv")]
    pub argv: Vec<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
        }
    }

    /// Effective name of the target.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.argv
            .first()
            .map(|arg0| base_name(arg0))
            .unwrap_or_default()
    }
}

/// Target with its argv elements compiled to glob patterns.
#[derive(Debug, Clone)]
struct CompiledTarget {
    name: String,
    argv: Vec<Pattern>,
}

impl CompiledTarget {
    fn matches(&self, argv: &[String]) -> bool {
        self.argv
            .iter()
            .zip(argv)
            .all(|(pattern, arg)| pattern.matches_with(arg, ARGV_MATCH_OPTIONS))
    }
}

fn compile_argv(argv: &[String]) -> Result<Vec<Pattern>, PatternError> {
    argv.iter()
        .map(|elem| {
            Pattern::new(elem).map_err(|source| PatternError {
                pattern: elem.clone(),
                source,
            })
        })
        .collect()
}

/// Matches an observed argv against a pattern argv.
///
/// Only the first `min(argv.len(), pattern.len())` positions are compared, so
/// either side may be longer. Each position is a shell glob match of the
/// pattern element against the argv element.
///
/// Globbing is one-directional: only `pattern` elements are globs, and `argv`
/// is always taken literally, whichever side is shorter.
pub fn match_argv(argv: &[String], pattern: &[String]) -> Result<bool, PatternError> {
    let compiled = CompiledTarget {
        name: String::new(),
        argv: compile_argv(pattern)?,
    };
    Ok(compiled.matches(argv))
}

/// Scans a procfs tree for the configured targets.
#[derive(Debug, Clone)]
pub struct ProcScanner {
    targets: Vec<CompiledTarget>,
}

impl ProcScanner {
    /// Compiles the targets. Fails on the first malformed glob so bad
    /// configuration is rejected at startup.
    pub fn new(targets: &[Target]) -> Result<Self, PatternError> {
        let targets = targets
            .iter()
            .map(|t| {
                Ok(CompiledTarget {
                    name: t.display_name(),
                    argv: compile_argv(&t.argv)?,
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;
        Ok(Self { targets })
    }

    /// Names of the configured targets in declaration order.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.name.as_str())
    }

    /// Walks `proc_root` and returns, per target name, the PIDs of matching
    /// processes. A PID is reported under the first matching target only.
    #[instrument(skip(self))]
    pub fn scan(&self, proc_root: &Path) -> Result<ScanResult, ScanError> {
        let entries = collect_proc_entries(proc_root)?;
        debug!("Collected {} process entries from {}", entries.len(), proc_root.display());

        let matched: Vec<(&str, Pid)> = entries
            .par_iter()
            .filter_map(|entry| {
                let argv = read_proc_cmdline(&entry.proc_path.join("cmdline"));
                if argv.is_empty() {
                    return None;
                }
                self.find_target(&argv).map(|name| (name, entry.pid))
            })
            .collect();

        let mut res = ScanResult::new();
        for (name, pid) in matched {
            res.entry(name.to_string()).or_insert_with(Vec::new).push(pid);
        }
        for pids in res.values_mut() {
            pids.sort_unstable();
        }

        debug!(
            "Scan matched {} process(es) across {} target(s)",
            res.values().map(Vec::len).sum::<usize>(),
            res.len()
        );
        Ok(res)
    }

    fn find_target(&self, argv: &[String]) -> Option<&str> {
        self.targets
            .iter()
            .find(|t| t.matches(argv))
            .map(|t| t.name.as_str())
    }
}

/// Process entry representing a directory in the procfs tree.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub pid: Pid,
    pub proc_path: PathBuf,
}

/// Lists the numeric (per-process) directories under `root`.
pub fn collect_proc_entries(root: &Path) -> Result<Vec<ProcEntry>, ScanError> {
    let entries = fs::read_dir(root).map_err(|source| ScanError::ListProcRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let p = entry.path();
        let name = match p.file_name().and_then(|s| s.to_str()) {
            Some(v) => v,
            None => continue,
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let pid: Pid = match name.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        out.push(ProcEntry { pid, proc_path: p });
    }
    Ok(out)
}

/// Reads a NUL-separated cmdline file. Empty chunks are dropped; an
/// unreadable file yields an empty argv.
pub fn read_proc_cmdline(path: &Path) -> Vec<String> {
    match fs::read(path) {
        Ok(content) => content
            .split(|&b| b == 0u8)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Last element of a slash-separated path, following shell `basename`
/// conventions: trailing slashes are ignored, `"/"` stays `"/"` and an empty
/// input yields `"."`.
pub fn base_name(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}
