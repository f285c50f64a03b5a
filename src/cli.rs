//! CLI arguments for kubevirt-metrics-collector.
//!
//! This module defines the command-line interface using the clap library and
//! merges it over the configuration file.

use clap::{Parser, ValueEnum};
use kubevirt_metrics_collector::{load_config, Config, ConfigError, ConfigFormat};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "kubevirt-metrics-collector",
    about = "Prometheus exporter for the CPU and memory usage of KubeVirt pod infrastructure processes",
    long_about = "Prometheus exporter for the CPU and memory usage of KubeVirt pod infrastructure processes.\n\n\
                  Matches host processes against configured argv patterns, maps them to pods \
                  through their cgroup and the container runtime (CRI), and exports per-domain \
                  CPU and memory series.",
    version,
    after_help = "usage: kubevirt-metrics-collector /path/to/kubevirt-metrics-collector.json"
)]
pub struct Args {
    /// Config file (JSON/YAML/TOML)
    #[arg(value_name = "CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Config file, same as the positional argument
    #[arg(long = "config", value_name = "FILE", conflicts_with = "config_path")]
    pub config_flag: Option<PathBuf>,

    /// Address to listen on (host:port)
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Container runtime endpoint (unix:///path, /path, tcp://host:port)
    #[arg(long)]
    pub cri_endpoint: Option<String>,

    /// Value for the host label
    #[arg(long)]
    pub hostname: Option<String>,

    /// Background refresh period in seconds (0 disables)
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Maximum pod map age in milliseconds before a scrape refreshes it
    #[arg(long)]
    pub freshness_threshold_ms: Option<u64>,

    /// Root of the procfs tree to scan
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Enable pod resolution debug mode
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Run even if the connection to the CRI runtime fails
    #[arg(short = 'F', long)]
    pub fake: bool,

    /// Dump the available metrics and exit
    #[arg(short = 'M', long)]
    pub dump_metrics: bool,

    /// Validate (and dump) configuration and exit
    #[arg(short = 'C', long)]
    pub check_config: bool,

    /// Output format for --check-config
    #[arg(long, value_enum, default_value = "json")]
    pub config_format: ConfigFormat,

    /// Path to TLS certificate; the key is needed too to enable TLS
    #[arg(short = 'c', long)]
    pub cert_file: Option<PathBuf>,

    /// Path to TLS key; the certificate is needed too to enable TLS
    #[arg(short = 'k', long)]
    pub key_file: Option<PathBuf>,
}

impl Args {
    pub fn config_file(&self) -> Option<&PathBuf> {
        self.config_path.as_ref().or(self.config_flag.as_ref())
    }
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match args.config_file() {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    if let Some(addr) = &args.listen_address {
        config.listen_address = addr.clone();
    }
    if let Some(endpoint) = &args.cri_endpoint {
        config.cri_endpoint = endpoint.clone();
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = hostname.clone();
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }
    if let Some(ms) = args.freshness_threshold_ms {
        config.freshness_threshold_ms = ms;
    }
    if let Some(root) = &args.proc_root {
        config.proc_root = root.clone();
    }
    if args.debug {
        config.debug_mode = true;
    }
    if args.fake {
        config.fake_mode = true;
    }

    // Either TLS flag turns TLS on; validation then insists on both.
    if let Some(cert) = &args.cert_file {
        config.enable_tls = true;
        config.tls_cert_path = Some(cert.to_string_lossy().to_string());
    }
    if let Some(key) = &args.key_file {
        config.enable_tls = true;
        config.tls_key_path = Some(key.to_string_lossy().to_string());
    }

    Ok(config)
}
