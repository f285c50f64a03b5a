//! One-shot command implementations for kubevirt-metrics-collector.
//!
//! - `check`: configuration validation and dump (`-C`)
//! - `dump`: self-metrics dump (`-M`)

pub mod check;
pub mod dump;

pub use check::command_check_config;
pub use dump::command_dump_metrics;
