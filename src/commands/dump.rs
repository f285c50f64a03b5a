//! Dump command implementation.
//!
//! Collects metrics for the collector's own process only, without a
//! container runtime, and writes the exposition text to stderr. Useful to
//! check which series a deployment would export.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use kubevirt_metrics_collector::{
    register_build_info, BuildInfo, CollectorMetrics, Exporter, PrometheusUpdater, RefreshCache,
    SelfPodFinder,
};
use prometheus::Registry;

/// Renders one scrape of the self collector. `host` becomes the host label.
pub async fn render_self_metrics(
    proc_root: &std::path::Path,
    host: &str,
) -> Result<String, anyhow::Error> {
    let registry = Registry::new();
    let updater = PrometheusUpdater::new(&registry, host).context("registering process metrics")?;
    let telemetry = CollectorMetrics::new(&registry).context("registering collector metrics")?;
    register_build_info(&registry, &BuildInfo::current()).context("registering build info")?;

    let cache = Arc::new(RefreshCache::new(
        Arc::new(SelfPodFinder::new(proc_root)),
        Duration::from_secs(1),
    ));
    let exporter = Exporter::new(registry, cache, Arc::new(updater), telemetry);
    exporter.render().await.context("encoding metrics")
}

/// Dumps the self collector's metrics to stderr. Returns the process exit
/// code.
pub async fn command_dump_metrics(proc_root: &std::path::Path, host: &str) -> i32 {
    match render_self_metrics(proc_root, host).await {
        Ok(text) => {
            eprint!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("❌ Failed to dump metrics: {:#}", e);
            1
        }
    }
}
