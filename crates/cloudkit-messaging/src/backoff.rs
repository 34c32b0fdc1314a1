//! Reconnect backoff.
//!
//! [`Backoff`] starts at `minimum` and multiplies the wait by `factor` after
//! every call until it reaches `maximum`. With minimum 500 ms, maximum
//! 3000 ms and factor 1.5 it sleeps 500, 750, 1125, 1688, 2531, 3000,
//! 3000 ... until [`RetryBackoff::reset`] is called.

use std::time::Duration;

use async_trait::async_trait;
use cloudkit_settings::BackoffSettings;
use parking_lot::Mutex;
use tracing::info;

/// Delay policy awaited before each connect attempt.
#[async_trait]
pub trait RetryBackoff: Send + Sync {
    /// Sleep for the current delay, then advance it.
    async fn backoff(&self);

    /// Restore the initial delay.
    fn reset(&self);
}

/// Geometric backoff clamped to `[minimum, maximum]`.
#[derive(Debug)]
pub struct Backoff {
    minimum_ms: f64,
    maximum_ms: f64,
    factor: f64,
    wait_ms: Mutex<f64>,
}

impl Backoff {
    /// Create a backoff policy.
    ///
    /// A `factor` below 1 is treated as 1 and a `maximum` below `minimum` is
    /// raised to `minimum`, so the delay never shrinks.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(minimum: Duration, maximum: Duration, factor: f64) -> Self {
        let minimum_ms = minimum.as_millis() as f64;
        let maximum_ms = (maximum.as_millis() as f64).max(minimum_ms);
        let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        Self {
            minimum_ms,
            maximum_ms,
            factor,
            wait_ms: Mutex::new(minimum_ms),
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.minimum_ms),
            Duration::from_millis(settings.maximum_ms),
            settings.factor,
        )
    }

    /// The delay the next [`RetryBackoff::backoff`] call will sleep.
    pub fn current_delay(&self) -> Duration {
        to_duration(*self.wait_ms.lock())
    }

    /// Return the current delay and advance, without sleeping.
    pub fn next_delay(&self) -> Duration {
        let mut wait = self.wait_ms.lock();
        let current = *wait;
        *wait = (current * self.factor).min(self.maximum_ms);
        to_duration(current)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}

#[async_trait]
impl RetryBackoff for Backoff {
    async fn backoff(&self) {
        let delay = self.next_delay();
        info!(delay_ms = delay.as_millis(), "backoff sleep");
        tokio::time::sleep(delay).await;
    }

    fn reset(&self) {
        info!(delay_ms = self.minimum_ms, "backoff reset");
        *self.wait_ms.lock() = self.minimum_ms;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_duration(ms: f64) -> Duration {
    Duration::from_millis(ms.round() as u64)
}
