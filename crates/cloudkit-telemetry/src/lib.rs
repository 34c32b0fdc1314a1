//! # cloudkit-telemetry
//!
//! Logging and metrics plumbing for the messaging client.
//!
//! - [`init_subscriber`] / [`init_json_subscriber`] install the global
//!   `tracing` subscriber
//! - [`MetricsRecorder`] keeps counters and latency histograms in memory
//! - [`LogMetrics`] writes each measurement as a JSON line on the
//!   `cloudkit::metrics` tracing target, or to hourly files through
//!   [`RotatingMetricsFile`]

#![deny(unsafe_code)]

mod log_metrics;
mod metrics_file;
mod recorder;

pub use log_metrics::{LogMetrics, METRICS_TARGET, MetricItem, MetricUnit};
pub use metrics_file::{DEFAULT_RETENTION_HOURS, METRICS_FILE_EXTENSION, RotatingMetricsFile};
pub use recorder::{HistogramSummary, MetricsRecorder};

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with compact stderr output.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON lines on stderr.
pub fn init_json_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(true)
        .with_writer(std::io::stderr);

    let _ = subscriber.try_init();
}
