//! Prometheus metrics definitions for kubevirt-metrics-collector.
//!
//! Per-process series are recorded through the [`MetricsUpdater`] trait so the
//! exporter does not depend on a particular registry layout. All metrics are
//! registered on a caller-supplied [`Registry`]; nothing here is global.

use prometheus::{Gauge, GaugeVec, IntCounterVec, Opts, Registry};

use crate::process::{CpuTimes, MemoryInfo, ProcessHandle, SampleError};

/// Labels shared by the per-process families.
const PROCESS_LABELS: &[&str] = &["host", "domain", "process", "type"];

/// Records CPU and memory samples of one process of one domain.
pub trait MetricsUpdater: Send + Sync {
    fn update_cpu(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError>;

    fn update_memory(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError>;

    /// Records CPU and memory of `process`. Implementations should write
    /// nothing when either sample fails; the default records CPU first and
    /// may leave it behind on a memory failure.
    fn update_process(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError> {
        self.update_cpu(domain, process)?;
        self.update_memory(domain, process)
    }

    /// Drops every recorded series, so processes that went away stop being
    /// reported.
    fn reset(&self);
}

/// [`MetricsUpdater`] writing into Prometheus gauge families.
///
/// Processes of one domain sharing a base name map to the same label set;
/// their samples are summed. The families are reset at the start of every
/// scrape, so a sum never carries over between scrapes.
#[derive(Clone)]
pub struct PrometheusUpdater {
    host: String,
    cpu_seconds: GaugeVec,
    memory_bytes: GaugeVec,
}

impl PrometheusUpdater {
    /// Creates and registers the per-process families.
    pub fn new(registry: &Registry, host: impl Into<String>) -> prometheus::Result<Self> {
        let cpu_seconds = GaugeVec::new(
            Opts::new(
                "kubevirt_pod_infra_cpu_seconds_total",
                "CPU time spent, seconds.",
            ),
            PROCESS_LABELS,
        )?;
        let memory_bytes = GaugeVec::new(
            Opts::new(
                "kubevirt_pod_infra_memory_amount_bytes",
                "Memory amount, bytes.",
            ),
            PROCESS_LABELS,
        )?;

        registry.register(Box::new(cpu_seconds.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            host: host.into(),
            cpu_seconds,
            memory_bytes,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl PrometheusUpdater {
    fn record_cpu(&self, domain: &str, process: &ProcessHandle, times: &CpuTimes) {
        for (kind, value) in [("user", times.user_seconds), ("system", times.system_seconds)] {
            self.cpu_seconds
                .with_label_values(&[&self.host, domain, process.name(), kind])
                .add(value);
        }
    }

    fn record_memory(&self, domain: &str, process: &ProcessHandle, info: &MemoryInfo) {
        for (kind, bytes) in info.amounts() {
            self.memory_bytes
                .with_label_values(&[&self.host, domain, process.name(), kind])
                .add(bytes as f64);
        }
    }
}

impl MetricsUpdater for PrometheusUpdater {
    fn update_cpu(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError> {
        let times = process.cpu_times()?;
        self.record_cpu(domain, process, &times);
        Ok(())
    }

    fn update_memory(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError> {
        let info = process.memory_info()?;
        self.record_memory(domain, process, &info);
        Ok(())
    }

    fn update_process(&self, domain: &str, process: &ProcessHandle) -> Result<(), SampleError> {
        let times = process.cpu_times()?;
        let info = process.memory_info()?;
        self.record_cpu(domain, process, &times);
        self.record_memory(domain, process, &info);
        Ok(())
    }

    fn reset(&self) {
        self.cpu_seconds.reset();
        self.memory_bytes.reset();
    }
}

/// The collector's own health metrics.
#[derive(Clone)]
pub struct CollectorMetrics {
    pub scrape_duration: Gauge,
    pub processes_exported: Gauge,
    pub domains: Gauge,
    pub refresh_duration: Gauge,
    pub refresh_success: Gauge,
    pub resolution_misses: IntCounterVec,
}

impl CollectorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let scrape_duration = Gauge::new(
            "kubevirt_metrics_collector_scrape_duration_seconds",
            "Time spent serving the last /metrics request",
        )?;
        let processes_exported = Gauge::new(
            "kubevirt_metrics_collector_processes",
            "Number of processes exported in the last scrape",
        )?;
        let domains = Gauge::new(
            "kubevirt_metrics_collector_domains",
            "Number of domains exported in the last scrape",
        )?;
        let refresh_duration = Gauge::new(
            "kubevirt_metrics_collector_refresh_duration_seconds",
            "Time spent in the last pod map refresh",
        )?;
        let refresh_success = Gauge::new(
            "kubevirt_metrics_collector_refresh_success",
            "Whether the last pod map refresh was successful (1) or failed (0)",
        )?;
        let resolution_misses = IntCounterVec::new(
            Opts::new(
                "kubevirt_metrics_collector_resolution_misses_total",
                "Matched processes that could not be mapped to a domain",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(processes_exported.clone()))?;
        registry.register(Box::new(domains.clone()))?;
        registry.register(Box::new(refresh_duration.clone()))?;
        registry.register(Box::new(refresh_success.clone()))?;
        registry.register(Box::new(resolution_misses.clone()))?;

        Ok(Self {
            scrape_duration,
            processes_exported,
            domains,
            refresh_duration,
            refresh_success,
            resolution_misses,
        })
    }
}

/// Build metadata reported by the `kubevirt_info` gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub branch: String,
    pub revision: String,
    pub version: String,
}

impl BuildInfo {
    /// Metadata of this binary, as captured at build time.
    pub fn current() -> Self {
        Self {
            branch: option_env!("VERGEN_GIT_BRANCH").unwrap_or("unknown").to_string(),
            revision: option_env!("VERGEN_GIT_SHA").unwrap_or("unknown").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Registers `kubevirt_info`, a constant 1 labelled with build metadata.
pub fn register_build_info(registry: &Registry, info: &BuildInfo) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(
        Opts::new("kubevirt_info", "Version information")
            .const_label("branch", info.branch.as_str())
            .const_label("revision", info.revision.as_str())
            .const_label("version", info.version.as_str()),
    )?;
    registry.register(Box::new(gauge.clone()))?;
    gauge.set(1.0);
    Ok(gauge)
}
