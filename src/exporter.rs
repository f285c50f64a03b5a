//! Scrape-time glue between the pod map and the metrics registry.
//!
//! Each scrape asks the [`RefreshCache`] for the current map and feeds every
//! process through the [`MetricsUpdater`]. A process that fails to sample is
//! skipped; a failed refresh falls back to the last-good map. The registry is
//! rendered under a lock so concurrent scrapes never interleave a reset with
//! another scrape's samples.

use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::cache::RefreshCache;
use crate::metrics::{CollectorMetrics, MetricsUpdater};
use crate::pods::{FindError, MissStats};

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub domains: usize,
    pub processes_exported: usize,
    pub processes_skipped: usize,
    /// Set when the refresh failed and a previous map was served instead.
    pub refresh_error: Option<String>,
}

pub struct Exporter {
    registry: Registry,
    cache: Arc<RefreshCache>,
    updater: Arc<dyn MetricsUpdater>,
    telemetry: CollectorMetrics,
    misses: Option<Arc<MissStats>>,
    render_lock: Mutex<()>,
}

impl Exporter {
    /// `registry` must be the one `updater` and `telemetry` registered on.
    pub fn new(
        registry: Registry,
        cache: Arc<RefreshCache>,
        updater: Arc<dyn MetricsUpdater>,
        telemetry: CollectorMetrics,
    ) -> Self {
        Self {
            registry,
            cache,
            updater,
            telemetry,
            misses: None,
            render_lock: Mutex::new(()),
        }
    }

    /// Exports the given resolution miss counters.
    pub fn with_miss_stats(mut self, misses: Arc<MissStats>) -> Self {
        self.misses = Some(misses);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<RefreshCache> {
        &self.cache
    }

    /// Refreshes the pod map if due and records a sample for every process.
    ///
    /// Fails only when the refresh failed and no map was ever produced; in
    /// every other case the series reflect the newest map available.
    #[instrument(skip(self))]
    pub async fn collect(&self) -> Result<CollectReport, FindError> {
        let mut report = CollectReport::default();

        let pods = match self.cache.update().await {
            Ok(pods) => pods,
            Err(e) => {
                let status = self.cache.status().await;
                self.record_refresh(&status);
                if !status.has_data() {
                    self.updater.reset();
                    return Err(e);
                }
                warn!("Serving last known pod map: {}", e);
                report.refresh_error = Some(e.to_string());
                self.cache.snapshot().await
            }
        };

        self.updater.reset();
        for (domain, info) in pods.iter() {
            for process in &info.processes {
                match self.updater.update_process(domain, process) {
                    Ok(()) => report.processes_exported += 1,
                    Err(e) => {
                        debug!("Skipping {} pid {}: {}", domain, process.pid(), e);
                        report.processes_skipped += 1;
                    }
                }
            }
        }
        report.domains = pods.len();

        self.telemetry.domains.set(report.domains as f64);
        self.telemetry
            .processes_exported
            .set(report.processes_exported as f64);
        if report.refresh_error.is_none() {
            let status = self.cache.status().await;
            self.record_refresh(&status);
        }
        self.sync_misses();

        debug!(
            "Updated metrics for {} processes in {} domains ({} skipped)",
            report.processes_exported, report.domains, report.processes_skipped
        );
        Ok(report)
    }

    /// Collects and encodes the whole registry in text exposition format.
    #[instrument(skip(self))]
    pub async fn render(&self) -> Result<String, prometheus::Error> {
        let _guard = self.render_lock.lock().await;
        let start = Instant::now();

        if let Err(e) = self.collect().await {
            warn!("No pod map available yet: {}", e);
        }
        self.telemetry
            .scrape_duration
            .set(start.elapsed().as_secs_f64());

        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn record_refresh(&self, status: &crate::cache::CacheStatus) {
        self.telemetry
            .refresh_duration
            .set(status.last_refresh_duration_seconds);
        self.telemetry
            .refresh_success
            .set(if status.last_refresh_success { 1.0 } else { 0.0 });
    }

    fn sync_misses(&self) {
        let Some(misses) = &self.misses else {
            return;
        };
        for (reason, total) in misses.snapshot() {
            let counter = self.telemetry.resolution_misses.with_label_values(&[reason]);
            let seen = counter.get();
            if total > seen {
                counter.inc_by(total - seen);
            }
        }
    }
}
