//! Application state management for the collector.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers and used by the background refresh task.

use kubevirt_metrics_collector::{Config, Exporter, RefreshCache};
use std::sync::Arc;
use std::time::Instant;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests and background tasks.
pub struct AppState {
    pub exporter: Arc<Exporter>,
    pub config: Arc<Config>,
    /// Whether pods are resolved through the container runtime (false in
    /// fake mode after a failed connection).
    pub runtime_connected: bool,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn cache(&self) -> &Arc<RefreshCache> {
        self.exporter.cache()
    }
}
