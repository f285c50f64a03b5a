//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that reports whether
//! the pod map has been refreshed successfully.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let status = state.cache().status().await;

    // Healthy once a refresh has succeeded; a failed latest refresh with an
    // older map still available is reported but not fatal.
    let code = if status.has_data() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let message = match (status.has_data(), status.last_refresh_success) {
        (true, true) => "OK",
        (true, false) => "OK - Serving last known pod map",
        (false, _) if status.refresh_count == 0 => "Waiting for first refresh",
        (false, _) => "Pod map refresh failed",
    };

    let mut out = String::new();
    writeln!(out, "{}", message).ok();
    writeln!(out).ok();
    writeln!(out, "Uptime:             {}s", state.start_time.elapsed().as_secs()).ok();
    writeln!(
        out,
        "Runtime:            {}",
        if state.runtime_connected {
            state.config.cri_endpoint.as_str()
        } else {
            "not connected (fake mode)"
        }
    )
    .ok();
    writeln!(out, "Domains:            {}", status.domains).ok();
    writeln!(out, "Processes:          {}", status.processes).ok();
    writeln!(out, "Refreshes:          {}", status.refresh_count).ok();
    writeln!(out, "Failed refreshes:   {}", status.failure_count).ok();
    writeln!(
        out,
        "Last refresh:       {}",
        status
            .last_refreshed
            .map(|t| format!("{:.1}s ago", t.elapsed().as_secs_f64()))
            .unwrap_or_else(|| "never".to_string())
    )
    .ok();
    writeln!(
        out,
        "Refresh duration:   {:.3}s",
        status.last_refresh_duration_seconds
    )
    .ok();

    debug!("Health check: {} - {}", code, message);
    (code, [("Content-Type", "text/plain; charset=utf-8")], out)
}
