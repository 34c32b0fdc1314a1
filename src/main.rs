//! # cloudkit
//!
//! Command-line client for the cloudkit message service: listen on topics
//! through a resilient session, or publish over HTTP.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudkit_core::{BroadcastRequest, Metrics, SendToRequest};
use cloudkit_messaging::{HttpPublisher, Publisher, Session, SessionConfig, WsTransportProvider};
use cloudkit_settings::CloudkitSettings;
use cloudkit_telemetry::{LogMetrics, RotatingMetricsFile};
use serde_json::Value;

/// cloudkit message service client.
#[derive(Parser, Debug)]
#[command(name = "cloudkit", version, about = "cloudkit message service client")]
struct Cli {
    /// Settings file (defaults to `~/.cloudkit/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// WebSocket endpoint (overrides settings).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log filter, e.g. `debug` or `cloudkit_messaging=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to topics and print every event as a JSON line.
    Listen {
        /// Topic to subscribe to. Repeatable.
        #[arg(long = "topic", required = true)]
        topics: Vec<String>,
    },
    /// Broadcast a JSON payload to a topic.
    Publish {
        #[arg(long)]
        topic: String,
        /// JSON object to publish.
        #[arg(long)]
        payload: String,
        /// Sender id stamped on the event.
        #[arg(long)]
        sender_id: Option<String>,
    },
    /// Send a JSON payload to one recipient.
    Send {
        #[arg(long)]
        recipient: String,
        /// JSON object to send.
        #[arg(long)]
        payload: String,
        /// Sender id stamped on the event.
        #[arg(long)]
        sender_id: Option<String>,
    },
}

fn load(cli: &Cli) -> Result<CloudkitSettings> {
    let mut settings = match &cli.settings {
        Some(path) => cloudkit_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => cloudkit_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(endpoint) = &cli.endpoint {
        settings.connection.endpoint.clone_from(endpoint);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

fn parse_payload(raw: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(raw).context("Payload is not valid JSON")?;
    anyhow::ensure!(payload.is_object(), "Payload must be a JSON object");
    Ok(payload)
}

fn publisher(settings: &CloudkitSettings, sender_id: Option<String>) -> Result<HttpPublisher> {
    let publisher =
        HttpPublisher::new(&settings.publisher).context("Failed to create HTTP publisher")?;
    Ok(match sender_id {
        Some(id) => publisher.with_sender_id(id),
        None => publisher,
    })
}

fn metrics(settings: &CloudkitSettings) -> Result<LogMetrics> {
    let Some(dir) = &settings.logging.metrics_dir else {
        return Ok(LogMetrics::new("cloudkit"));
    };
    let file = RotatingMetricsFile::new(dir, settings.logging.metrics_retention_hours)
        .with_context(|| format!("Failed to open metrics directory {}", dir.display()))?;
    Ok(LogMetrics::to_file("cloudkit", Arc::new(file)))
}

async fn listen(settings: &CloudkitSettings, topics: Vec<String>) -> Result<()> {
    let metrics: Arc<dyn Metrics> = Arc::new(metrics(settings)?);
    let provider = Arc::new(WsTransportProvider::from_settings(settings, metrics.clone()));
    let session = Session::new(provider, SessionConfig::from_settings(settings, metrics));

    let _events = session.on_event(|event, sender| {
        let line = serde_json::json!({ "senderId": sender, "event": event });
        println!("{line}");
    });
    let _closes = session.on_close(|close| {
        tracing::info!(code = close.code, reason = %close.reason, "connection closed");
    });

    for topic in &topics {
        session.subscribe(topic).await?;
    }
    match session.init().await {
        Ok(report) if report.is_complete() => {
            tracing::info!(session_id = %session.id(), topics = report.succeeded, "listening");
        }
        Ok(report) => {
            tracing::warn!(failed = report.failed.len(), "some topics could not be subscribed");
        }
        // The session keeps reconnecting in the background.
        Err(error) => tracing::warn!(%error, "initial connection failed, retrying"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    session.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cloudkit_settings::init_settings(load(&cli)?).is_err() {
        anyhow::bail!("settings were initialized twice");
    }
    let settings = cloudkit_settings::get_settings();

    if settings.logging.json {
        cloudkit_telemetry::init_json_subscriber(&settings.logging.level);
    } else {
        cloudkit_telemetry::init_subscriber(&settings.logging.level);
    }

    match cli.command {
        Command::Listen { topics } => listen(settings, topics).await,
        Command::Publish {
            topic,
            payload,
            sender_id,
        } => {
            let payload = parse_payload(&payload)?;
            publisher(settings, sender_id)?
                .broadcast(BroadcastRequest::new(topic, payload))
                .await
                .context("Broadcast failed")
        }
        Command::Send {
            recipient,
            payload,
            sender_id,
        } => {
            let payload = parse_payload(&payload)?;
            let response = publisher(settings, sender_id)?
                .send_to(SendToRequest::new(recipient, payload))
                .await
                .context("Send failed")?;
            println!("{response}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_listen_with_repeated_topics() {
        let cli = Cli::parse_from([
            "cloudkit",
            "--endpoint",
            "ws://example:9000",
            "listen",
            "--topic",
            "a",
            "--topic",
            "b",
        ]);
        assert_eq!(cli.endpoint.as_deref(), Some("ws://example:9000"));
        match cli.command {
            Command::Listen { topics } => assert_eq!(topics, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn payload_must_be_an_object() {
        assert!(parse_payload(r#"{"a": 1}"#).is_ok());
        assert!(parse_payload("[1]").is_err());
        assert!(parse_payload("nope").is_err());
    }

    #[test]
    fn cli_flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"connection": {"endpoint": "ws://file:1"}}"#).unwrap();
        let cli = Cli::parse_from([
            "cloudkit",
            "--settings",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
            "publish",
            "--topic",
            "t",
            "--payload",
            "{}",
        ]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.connection.endpoint.starts_with("ws://"));
    }

    #[test]
    fn metrics_dir_routes_metrics_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = CloudkitSettings::default();
        settings.logging.metrics_dir = Some(dir.path().join("metrics"));

        let sink = metrics(&settings).unwrap();
        sink.increment_counter("WsErrorCount");

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("metrics"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with(".metrics"));
    }
}
