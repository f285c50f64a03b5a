//! Configuration management for kubevirt-metrics-collector.
//!
//! This module handles loading and validating configuration files. JSON is the
//! historical format; YAML and TOML are accepted by file extension.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::cri::DEFAULT_DOMAIN_ANNOTATION;
use crate::process::{PatternError, ProcScanner, Target};

// Default configuration constants
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8443";
pub const DEFAULT_CRI_ENDPOINT: &str = "unix:///var/run/crio/crio.sock";
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_FRESHNESS_THRESHOLD_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Environment variable consulted when no hostname is configured.
pub const NODE_NAME_ENV: &str = "KUBE_NODE_NAME";

/// Output format for configuration dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Json,
    Yaml,
    Toml,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading the configuration on '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing the configuration on '{path}': {message}")]
    Parse { path: PathBuf, message: String },
    #[error("missing process(es) to track")]
    NoTargets,
    #[error("target #{index} has an empty argv pattern")]
    EmptyTargetArgv { index: usize },
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),
    #[error("missing listen address")]
    EmptyListenAddress,
    #[error("invalid listen address '{address}': expected host:port")]
    InvalidListenAddress { address: String },
    #[error("missing CRI endpoint")]
    EmptyCriEndpoint,
    #[error("freshness threshold must be greater than zero")]
    ZeroFreshnessThreshold,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("TLS is enabled but {0} is not set")]
    TlsPathMissing(&'static str),
    #[error("TLS file {path} is unusable: {reason}")]
    TlsFile { path: String, reason: String },
    #[error("error getting the host name: {0}")]
    Hostname(#[source] nix::Error),
    #[error("error serializing the configuration: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server configuration
    #[serde(alias = "listenaddress")]
    pub listen_address: String,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    // Container runtime
    #[serde(alias = "criendpoint")]
    pub cri_endpoint: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub domain_annotation: String,

    /// Value of the `host` label. Empty means resolve at startup.
    pub hostname: String,
    pub proc_root: PathBuf,

    // Refresh behaviour
    /// Background refresh period; 0 leaves refreshing to scrapes.
    pub poll_interval_secs: u64,
    pub freshness_threshold_ms: u64,
    /// Keep polling after a failed refresh instead of stopping the agent.
    pub auto_track: bool,
    /// Serve an empty pod map if the container runtime is unreachable at
    /// startup.
    pub fake_mode: bool,

    #[serde(alias = "debugmode")]
    pub debug_mode: bool,

    /// Processes to track. Kept last: TOML needs plain values before arrays
    /// of tables.
    pub targets: Vec<Target>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            cri_endpoint: DEFAULT_CRI_ENDPOINT.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            domain_annotation: DEFAULT_DOMAIN_ANNOTATION.to_string(),
            hostname: String::new(),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            freshness_threshold_ms: DEFAULT_FRESHNESS_THRESHOLD_MS,
            auto_track: true,
            fake_mode: false,
            debug_mode: false,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn freshness_threshold(&self) -> Duration {
        Duration::from_millis(self.freshness_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress {
                address: self.listen_address.clone(),
            })
    }

    /// Checks that the configuration is consistent and usable. Target patterns
    /// are compiled so a malformed glob is rejected here rather than at the
    /// first scan.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if let Some(index) = self.targets.iter().position(|t| t.argv.is_empty()) {
            return Err(ConfigError::EmptyTargetArgv { index });
        }
        ProcScanner::new(&self.targets)?;

        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddress);
        }
        self.listen_socket_addr()?;

        if self.cri_endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyCriEndpoint);
        }
        if self.freshness_threshold_ms == 0 {
            return Err(ConfigError::ZeroFreshnessThreshold);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("request_timeout_secs"));
        }

        if self.enable_tls {
            let cert = self
                .tls_cert_path
                .as_deref()
                .ok_or(ConfigError::TlsPathMissing("tls_cert_path"))?;
            let key = self
                .tls_key_path
                .as_deref()
                .ok_or(ConfigError::TlsPathMissing("tls_key_path"))?;
            check_tls_file(cert)?;
            check_tls_file(key)?;
        }

        Ok(())
    }

    /// Fills in `hostname` when unset: `KUBE_NODE_NAME` first, then the
    /// system host name.
    pub fn resolve_hostname(&mut self) -> Result<(), ConfigError> {
        if !self.hostname.is_empty() {
            return Ok(());
        }
        if let Ok(name) = std::env::var(NODE_NAME_ENV) {
            if !name.is_empty() {
                debug!("Using host name from {}: {}", NODE_NAME_ENV, name);
                self.hostname = name;
                return Ok(());
            }
        }
        let name = nix::unistd::gethostname().map_err(ConfigError::Hostname)?;
        self.hostname = name.to_string_lossy().into_owned();
        debug!("Using system host name: {}", self.hostname);
        Ok(())
    }

    /// Renders the configuration in the requested format.
    pub fn render(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        let out = match format {
            ConfigFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Yaml => {
                serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
        };
        Ok(out)
    }
}

fn check_tls_file(path: &str) -> Result<(), ConfigError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => Err(ConfigError::TlsFile {
            path: path.to_string(),
            reason: "file is empty".to_string(),
        }),
        Ok(_) => Ok(()),
        Err(e) => Err(ConfigError::TlsFile {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Loads a configuration file. The format is picked by extension (`.yaml`,
/// `.yml`, `.toml`, anything else is JSON). An empty file yields the
/// defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?
        }
        Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
    };
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}
