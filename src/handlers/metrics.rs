//! Metrics endpoint handler for Prometheus scraping.
//!
//! The scrape drives the pod map refresh itself when the cached map is stale,
//! so `/metrics` works even with the background poller disabled.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, error, instrument};

use crate::state::SharedState;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response()
    }
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    debug!("Processing /metrics request");

    let body = state.exporter.render().await.map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        MetricsError::EncodingFailed
    })?;

    Ok((
        [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}
