//! kubevirt-metrics-collector
//!
//! Prometheus exporter for the CPU and memory usage of the infrastructure
//! processes (qemu, virt-launcher, ...) of KubeVirt pods. This is the main
//! entry point that resolves configuration, wires the pipeline and serves
//! HTTP.

mod cache_updater;
mod cli;
mod commands;
mod handlers;
mod state;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kubevirt_metrics_collector::{
    register_build_info, BuildInfo, CollectorMetrics, Config, CriPodFinder, Exporter, FindError,
    InventoryOptions, MissStats, NullPodFinder, PodFinder, PrometheusUpdater, ProcScanner, RefreshCache,
    RuntimeInventory,
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

use cli::{resolve_config, Args, LogLevel};
use commands::{command_check_config, command_dump_metrics};
use handlers::{health_handler, metrics_handler, root_handler};
use state::{AppState, SharedState};

/// Exit code when the container runtime is unreachable and fake mode is off.
const EXIT_RUNTIME_UNAVAILABLE: i32 = 2;

/// Initializes tracing logging subsystem with configured log level. Debug
/// mode raises the level to at least `debug`.
fn setup_logging(args: &Args, debug_mode: bool) {
    let mut log_level = match args.log_level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };
    if debug_mode && log_level < LevelFilter::DEBUG {
        log_level = LevelFilter::DEBUG;
    }

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    info!("Logging initialized with level: {}", log_level);
}

/// Builds the pod finder backed by the container runtime. Without fake mode
/// an unreachable runtime ends the process.
async fn build_pod_finder(
    config: &Config,
) -> anyhow::Result<(Arc<dyn PodFinder>, Option<Arc<MissStats>>)> {
    let scanner = ProcScanner::new(&config.targets).context("compiling target patterns")?;
    for name in scanner.target_names() {
        debug!("Tracking target: {}", name);
    }

    let options = InventoryOptions {
        domain_annotation: config.domain_annotation.clone(),
        proc_root: config.proc_root.clone(),
        debug: config.debug_mode,
    };

    match RuntimeInventory::connect(
        &config.cri_endpoint,
        config.connect_timeout(),
        config.request_timeout(),
        options,
    )
    .await
    {
        Ok(inventory) => {
            info!("Connected to container runtime at {}", config.cri_endpoint);
            let finder = CriPodFinder::new(scanner, inventory);
            let misses = finder.miss_stats();
            Ok((Arc::new(finder), Some(misses)))
        }
        Err(e) if config.fake_mode => {
            warn!("Container runtime unavailable, running in fake mode: {}", e);
            Ok((Arc::new(NullPodFinder), None))
        }
        Err(e) => {
            error!("Cannot connect to container runtime: {}", e);
            std::process::exit(EXIT_RUNTIME_UNAVAILABLE);
        }
    }
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Resolves only if the poller stops; pending forever when there is none.
async fn poller_stopped(handle: Option<JoinHandle<Result<(), FindError>>>) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(())) => "poller exited".to_string(),
            Ok(Err(e)) => format!("pod map refresh failed: {}", e),
            Err(e) => format!("poller task failed: {}", e),
        },
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match resolve_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }
    };

    if args.check_config {
        std::process::exit(command_check_config(&config, args.config_format));
    }

    setup_logging(&args, config.debug_mode);

    if let Err(e) = config.resolve_hostname() {
        eprintln!("❌ Cannot determine host name: {}", e);
        std::process::exit(1);
    }

    if args.dump_metrics {
        std::process::exit(command_dump_metrics(&config.proc_root, &config.hostname).await);
    }

    if let Err(e) = config.validate() {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    info!(
        "Starting kubevirt-metrics-collector {} on host {}",
        env!("CARGO_PKG_VERSION"),
        config.hostname
    );
    debug!("Effective configuration: {:?}", config);

    // Metrics
    let registry = Registry::new();
    let updater = PrometheusUpdater::new(&registry, config.hostname.as_str())?;
    let telemetry = CollectorMetrics::new(&registry)?;
    register_build_info(&registry, &BuildInfo::current())?;

    // Pod resolution
    let (finder, misses) = build_pod_finder(&config).await?;
    let runtime_connected = misses.is_some();
    let cache = Arc::new(RefreshCache::new(finder, config.freshness_threshold()));

    let mut exporter = Exporter::new(registry, Arc::clone(&cache), Arc::new(updater), telemetry);
    if let Some(misses) = misses {
        exporter = exporter.with_miss_stats(misses);
    }

    let addr = config.listen_socket_addr()?;
    let state: SharedState = Arc::new(AppState {
        exporter: Arc::new(exporter),
        config: Arc::new(config.clone()),
        runtime_connected,
        start_time: Instant::now(),
    });

    // Perform initial pod map population
    info!("Performing initial pod map refresh");
    match cache.update().await {
        Ok(pods) => info!("Initial refresh found {} domains", pods.len()),
        Err(e) => error!("Initial pod map refresh failed: {}", e),
    }

    let poller = match config.poll_interval() {
        Some(period) => {
            info!("Refreshing pod map every {:?}", period);
            Some(tokio::spawn(cache_updater::run_poller(
                Arc::clone(&cache),
                period,
                config.auto_track,
            )))
        }
        None => {
            info!("No background refresh task - updates will be triggered by /metrics requests");
            None
        }
    };

    // Configure HTTP server routes
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    if config.enable_tls {
        let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path)
        else {
            return Err("TLS enabled without certificate and key".into());
        };

        info!("Loading TLS certificate from: {}", cert_path);
        info!("Loading TLS private key from: {}", key_path);

        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| {
                error!("Failed to load TLS configuration: {}", e);
                e
            })?;

        info!("kubevirt-metrics-collector listening on https://{}", addr);

        let server = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service());

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
            }
            reason = poller_stopped(poller) => {
                error!("Stopping: {}", reason);
                return Err(reason.into());
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received, exiting...");
            }
        }
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!("kubevirt-metrics-collector listening on http://{}", addr);

        let server = axum::serve(listener, app);

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
            }
            reason = poller_stopped(poller) => {
                error!("Stopping: {}", reason);
                return Err(reason.into());
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received, exiting...");
            }
        }
    }

    info!("kubevirt-metrics-collector stopped gracefully");
    Ok(())
}
