//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CloudkitSettings::default()`]
//! 2. If `~/.cloudkit/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{CloudkitSettings, KeepaliveMode};

/// Resolve the path to the settings file (`~/.cloudkit/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cloudkit").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CloudkitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or out-of-range values, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<CloudkitSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
pub(crate) fn load_file_layer(path: &Path) -> Result<CloudkitSettings> {
    let defaults = serde_json::to_value(CloudkitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut CloudkitSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Split out from [`apply_env_overrides`] so tests don't mutate the process
/// environment.
pub fn apply_overrides<F>(settings: &mut CloudkitSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("CLOUDKIT_ENDPOINT") {
        settings.connection.endpoint = v;
    }
    if let Some(v) = env.u64("CLOUDKIT_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.connection.connect_timeout_ms = v;
    }

    // ── Keepalive ───────────────────────────────────────────────────
    if let Some(v) = env.string("CLOUDKIT_KEEPALIVE_MODE") {
        match parse_keepalive_mode(&v) {
            Some(mode) => settings.keepalive.mode = mode,
            None => tracing::warn!(value = %v, "invalid keepalive mode env var, ignoring"),
        }
    }
    if let Some(v) = env.u64("CLOUDKIT_PING_INTERVAL_MS", 100, 86_400_000) {
        settings.keepalive.ping_interval_ms = v;
    }
    if let Some(v) = env.u64("CLOUDKIT_PONG_TIMEOUT_MS", 10, 600_000) {
        settings.keepalive.pong_timeout_ms = v;
    }
    if let Some(v) = env.u64("CLOUDKIT_APP_PING_INTERVAL_MS", 1_000, 86_400_000) {
        settings.keepalive.application_ping_interval_ms = v;
    }

    // ── Backoff ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("CLOUDKIT_BACKOFF_MIN_MS", 0, 3_600_000) {
        settings.backoff.minimum_ms = v;
    }
    if let Some(v) = env.u64("CLOUDKIT_BACKOFF_MAX_MS", 0, 3_600_000) {
        settings.backoff.maximum_ms = v;
    }
    if let Some(v) = env.f64("CLOUDKIT_BACKOFF_FACTOR", 1.0, 100.0) {
        settings.backoff.factor = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.usize("CLOUDKIT_RESUBSCRIBE_BATCH", 1, 10_000) {
        settings.session.resubscribe_batch_size = v;
    }

    // ── Publisher ───────────────────────────────────────────────────
    if let Some(v) = env.string("CLOUDKIT_PUBLISHER_URL") {
        settings.publisher.base_url = v;
    }
    if let Some(v) = env.u64("CLOUDKIT_PUBLISHER_TIMEOUT_MS", 100, 600_000) {
        settings.publisher.timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CLOUDKIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CLOUDKIT_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.string("CLOUDKIT_METRICS_DIR") {
        settings.logging.metrics_dir = Some(v.into());
    }
    if let Some(v) = env.u64("CLOUDKIT_METRICS_RETENTION_HOURS", 1, 24 * 365) {
        settings.logging.metrics_retention_hours = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

/// Parse a keepalive mode name.
///
/// Accepts `watchdog` and `applicationPing` (also `application-ping`,
/// `application_ping`), case-insensitive.
pub fn parse_keepalive_mode(val: &str) -> Option<KeepaliveMode> {
    match val.to_lowercase().replace(['-', '_'], "").as_str() {
        "watchdog" => Some(KeepaliveMode::Watchdog),
        "applicationping" => Some(KeepaliveMode::ApplicationPing),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        let val = (self.lookup)(name)?;
        let result = parse_f64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid f64 env var, ignoring");
        }
        result
    }
}
