//! KubeVirt Metrics Collector Library
//!
//! This library discovers which host processes belong to which KubeVirt
//! domain (pod) and exposes their CPU and memory usage as Prometheus metrics.
//!
//! # Pipeline
//!
//! - **Scan**: [`process::ProcScanner`] matches `/proc/<pid>/cmdline` against
//!   configured argv glob patterns
//! - **Resolve**: [`cri::RuntimeInventory`] maps each PID's cgroup container
//!   id to a pod sandbox and the sandbox to a domain name
//! - **Cache**: [`cache::RefreshCache`] serves the resulting pod map and
//!   refreshes it once it is older than the freshness threshold
//! - **Export**: [`exporter::Exporter`] samples every process on scrape and
//!   renders the registry
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kubevirt_metrics_collector::{
//!     CollectorMetrics, Exporter, PrometheusUpdater, RefreshCache, SelfPodFinder,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = prometheus::Registry::new();
//! let updater = PrometheusUpdater::new(&registry, "node-1")?;
//! let telemetry = CollectorMetrics::new(&registry)?;
//! let cache = Arc::new(RefreshCache::new(
//!     Arc::new(SelfPodFinder::new("/proc")),
//!     std::time::Duration::from_secs(1),
//! ));
//!
//! let exporter = Exporter::new(registry, cache, Arc::new(updater), telemetry);
//! println!("{}", exporter.render().await?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod cri;
pub mod exporter;
pub mod metrics;
pub mod pods;
pub mod process;

// Re-export main types for convenience
pub use cache::{CacheStatus, RefreshCache, DEFAULT_FRESHNESS_THRESHOLD};
pub use config::{load_config, Config, ConfigError, ConfigFormat};
pub use cri::{InventoryOptions, RuntimeClient, RuntimeError, RuntimeInventory};
pub use exporter::{CollectReport, Exporter};
pub use metrics::{register_build_info, BuildInfo, CollectorMetrics, MetricsUpdater, PrometheusUpdater};
pub use pods::{
    CriPodFinder, FindError, MissStats, NullPodFinder, PodFinder, PodInfo, PodInfoMap,
    ResolveError, SelfPodFinder,
};
pub use process::{match_argv, Pid, ProcScanner, ProcessHandle, Target};
