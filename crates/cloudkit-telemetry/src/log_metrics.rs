//! Metrics sink that reports each measurement as one JSON line.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use cloudkit_core::Metrics;
use serde::{Deserialize, Serialize};

use crate::metrics_file::RotatingMetricsFile;

/// Tracing target used by the default reporter.
pub const METRICS_TARGET: &str = "cloudkit::metrics";

/// Unit of a [`MetricItem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    /// Milliseconds.
    Ms,
    /// Plain count.
    Count,
}

/// One reported measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricItem {
    /// Reporting component.
    pub namespace: String,
    /// Static dimensions attached to every item from this sink.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
    /// Metric name.
    pub name: String,
    /// Measured value.
    pub value: i64,
    /// Unit of `value`.
    pub unit: MetricUnit,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

type Reporter = Arc<dyn Fn(&str) + Send + Sync>;

/// [`Metrics`] implementation that serializes every call to a JSON line.
///
/// By default lines go to `tracing` at info level on [`METRICS_TARGET`], so
/// they can be routed or filtered like any other log output.
#[derive(Clone)]
pub struct LogMetrics {
    namespace: String,
    dimensions: BTreeMap<String, String>,
    report: Reporter,
}

impl LogMetrics {
    /// Report through `tracing`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_reporter(namespace, |line: &str| {
            tracing::info!(target: METRICS_TARGET, "{line}");
        })
    }

    /// Append lines to hourly rotating files.
    pub fn to_file(namespace: impl Into<String>, file: Arc<RotatingMetricsFile>) -> Self {
        Self::with_reporter(namespace, move |line: &str| {
            if let Err(error) = file.write_line(line) {
                tracing::warn!(%error, dir = %file.dir().display(), "failed to write metric line");
            }
        })
    }

    /// Report through a custom callback.
    pub fn with_reporter<F>(namespace: impl Into<String>, report: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            namespace: namespace.into(),
            dimensions: BTreeMap::new(),
            report: Arc::new(report),
        }
    }

    /// Attach a dimension to every subsequent item.
    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Namespace of this sink.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn print(&self, name: &str, value: i64, unit: MetricUnit) {
        let item = MetricItem {
            namespace: self.namespace.clone(),
            dimensions: self.dimensions.clone(),
            name: name.to_string(),
            value,
            unit,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        match serde_json::to_string(&item) {
            Ok(line) => (self.report)(&line),
            Err(error) => tracing::warn!(%error, name, "failed to serialize metric item"),
        }
    }
}

impl std::fmt::Debug for LogMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMetrics")
            .field("namespace", &self.namespace)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl Metrics for LogMetrics {
    fn time(&self, name: &str, millis: i64) {
        self.print(name, millis, MetricUnit::Ms);
    }

    fn increment_counter(&self, name: &str) {
        self.print(name, 1, MetricUnit::Count);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn capture(namespace: &str) -> (LogMetrics, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let metrics = LogMetrics::with_reporter(namespace, move |line: &str| {
            sink.lock().push(line.to_string());
        });
        (metrics, lines)
    }

    #[test]
    fn time_reports_milliseconds() {
        let (metrics, lines) = capture("subscriber");
        metrics.time("TotalMessageLatency", 37);

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        let item: MetricItem = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(item.namespace, "subscriber");
        assert_eq!(item.name, "TotalMessageLatency");
        assert_eq!(item.value, 37);
        assert_eq!(item.unit, MetricUnit::Ms);
        assert!(item.timestamp.ends_with('Z'));
    }

    #[test]
    fn counter_reports_one() {
        let (metrics, lines) = capture("subscriber");
        metrics.increment_counter("WsCloseCount1006");

        let item: MetricItem = serde_json::from_str(&lines.lock()[0]).unwrap();
        assert_eq!(item.value, 1);
        assert_eq!(item.unit, MetricUnit::Count);
    }

    #[test]
    fn dimensions_are_attached() {
        let (metrics, lines) = capture("subscriber");
        let metrics = metrics.with_dimension("endpoint", "ws://relay");
        metrics.increment_counter("WsErrorCount");

        let value: serde_json::Value = serde_json::from_str(&lines.lock()[0]).unwrap();
        assert_eq!(value["dimensions"]["endpoint"], "ws://relay");
    }

    #[test]
    fn empty_dimensions_are_omitted() {
        let (metrics, lines) = capture("subscriber");
        metrics.time("OpenMessageWsLatency", 5);
        let value: serde_json::Value = serde_json::from_str(&lines.lock()[0]).unwrap();
        assert!(value.get("dimensions").is_none());
    }

    #[test]
    fn file_reporter_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(RotatingMetricsFile::new(dir.path(), 72).unwrap());
        let metrics = LogMetrics::to_file("subscriber", Arc::clone(&file));
        metrics.time("TotalMessageLatency", 12);
        metrics.increment_counter("WsCloseCount1000");

        let files = file.files().unwrap();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0].1).unwrap();
        let items: Vec<MetricItem> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "TotalMessageLatency");
        assert_eq!(items[1].unit, MetricUnit::Count);
    }

    #[test]
    fn default_reporter_does_not_panic() {
        let metrics = LogMetrics::new("cli");
        assert_eq!(metrics.namespace(), "cli");
        metrics.time("TotalMessageLatency", 1);
    }
}
