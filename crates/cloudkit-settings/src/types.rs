//! Settings type definitions.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]` so a
//! settings file only needs the keys it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudkitSettings {
    /// Message server connection.
    pub connection: ConnectionSettings,
    /// Keepalive strategy.
    pub keepalive: KeepaliveSettings,
    /// Reconnect backoff.
    pub backoff: BackoffSettings,
    /// Session behavior.
    pub session: SessionSettings,
    /// HTTP publisher.
    pub publisher: PublisherSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CloudkitSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.connection.endpoint.is_empty() {
            return Err(SettingsError::InvalidValue(
                "connection.endpoint must not be empty".into(),
            ));
        }
        if !self.backoff.factor.is_finite() || self.backoff.factor < 1.0 {
            return Err(SettingsError::InvalidValue(format!(
                "backoff.factor must be >= 1, got {}",
                self.backoff.factor
            )));
        }
        if self.backoff.minimum_ms > self.backoff.maximum_ms {
            return Err(SettingsError::InvalidValue(format!(
                "backoff.minimumMs ({}) exceeds backoff.maximumMs ({})",
                self.backoff.minimum_ms, self.backoff.maximum_ms
            )));
        }
        if self.session.resubscribe_batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "session.resubscribeBatchSize must be at least 1".into(),
            ));
        }
        if self.keepalive.ping_interval_ms == 0 || self.keepalive.application_ping_interval_ms == 0
        {
            return Err(SettingsError::InvalidValue(
                "keepalive intervals must be non-zero".into(),
            ));
        }
        if self.logging.metrics_retention_hours == 0 {
            return Err(SettingsError::InvalidValue(
                "logging.metricsRetentionHours must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Message server connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint URL.
    pub endpoint: String,
    /// Handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionSettings {
    /// Handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Which keepalive strategy a transport runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeepaliveMode {
    /// Protocol pings with a pong deadline.
    #[default]
    Watchdog,
    /// Periodic `{"action":"ping"}` text frames, no liveness check.
    ApplicationPing,
}

/// Keepalive settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Strategy to run.
    pub mode: KeepaliveMode,
    /// Watchdog: protocol ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Watchdog: how long to wait for a pong in milliseconds.
    pub pong_timeout_ms: u64,
    /// Application ping interval in milliseconds.
    pub application_ping_interval_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            mode: KeepaliveMode::Watchdog,
            ping_interval_ms: 60_000,
            pong_timeout_ms: 5_000,
            application_ping_interval_ms: 3_600_000,
        }
    }
}

/// Reconnect backoff settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffSettings {
    /// First delay in milliseconds.
    pub minimum_ms: u64,
    /// Ceiling in milliseconds.
    pub maximum_ms: u64,
    /// Growth factor applied after each delay.
    pub factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            minimum_ms: 100,
            maximum_ms: 500,
            factor: 1.5,
        }
    }
}

/// Session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Topics re-sent concurrently per batch after a reconnect.
    pub resubscribe_batch_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            resubscribe_batch_size: 30,
        }
    }
}

/// HTTP publisher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherSettings {
    /// Base URL of the publish API.
    pub base_url: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl PublisherSettings {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Write metric lines to hourly files here instead of the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_dir: Option<PathBuf>,
    /// Hours of metric files kept on rotation.
    pub metrics_retention_hours: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            metrics_dir: None,
            metrics_retention_hours: 72,
        }
    }
}
