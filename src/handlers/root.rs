//! Root endpoint handler.

use axum::{extract::State, response::IntoResponse};
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the root `/` endpoint.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing / request");

    let uptime_secs = state.start_time.elapsed().as_secs();
    let hours = uptime_secs / 3600;
    let minutes = (uptime_secs % 3600) / 60;
    let seconds = uptime_secs % 60;

    let targets: Vec<String> = state
        .config
        .targets
        .iter()
        .map(|t| format!("  - {} ({})", t.display_name(), t.argv.join(" ")))
        .collect();

    (
        [("Content-Type", "text/plain; charset=utf-8")],
        format!(
            "kubevirt-metrics-collector {}\n\n\
             Host:    {}\n\
             Uptime:  {}h {}m {}s\n\n\
             Endpoints:\n  /metrics  Prometheus metrics\n  /health   Refresh status\n\n\
             Targets:\n{}\n",
            env!("CARGO_PKG_VERSION"),
            state.config.hostname,
            hours,
            minutes,
            seconds,
            targets.join("\n")
        ),
    )
}
