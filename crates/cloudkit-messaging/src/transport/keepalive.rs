//! Keepalive strategies and the pong watchdog.

use std::time::Duration;

use cloudkit_settings::{KeepaliveMode, KeepaliveSettings};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Reason reported when the watchdog declares a connection dead.
pub const PING_PONG_CLOSE_REASON: &str = "Ping pong detected close.";

/// How a connection is kept alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keepalive {
    /// Protocol ping every `interval`; the connection is dead if no pong
    /// arrives within `pong_timeout`.
    ProtocolPing {
        /// Time between pings.
        interval: Duration,
        /// Pong deadline after each ping.
        pong_timeout: Duration,
    },
    /// `{"action":"ping","topic":""}` every `interval`. Nothing is awaited.
    ApplicationPing {
        /// Time between pings.
        interval: Duration,
    },
}

impl Keepalive {
    /// Strategy selected by settings.
    pub fn from_settings(settings: &KeepaliveSettings) -> Self {
        match settings.mode {
            KeepaliveMode::Watchdog => Self::ProtocolPing {
                interval: Duration::from_millis(settings.ping_interval_ms),
                pong_timeout: Duration::from_millis(settings.pong_timeout_ms),
            },
            KeepaliveMode::ApplicationPing => Self::ApplicationPing {
                interval: Duration::from_millis(settings.application_ping_interval_ms),
            },
        }
    }

    /// Time between pings.
    pub fn interval(&self) -> Duration {
        match self {
            Self::ProtocolPing { interval, .. } | Self::ApplicationPing { interval } => *interval,
        }
    }

    /// Ticker whose first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let period = self.interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Watchdog for this strategy, if it verifies liveness.
    pub fn watchdog(&self) -> Option<Watchdog> {
        match self {
            Self::ProtocolPing { pong_timeout, .. } => Some(Watchdog::new(*pong_timeout)),
            Self::ApplicationPing { .. } => None,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::from_settings(&KeepaliveSettings::default())
    }
}

/// Pong deadline armed by each ping and disarmed by a pong.
#[derive(Debug)]
pub struct Watchdog {
    pong_timeout: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// Disarmed watchdog.
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            deadline: None,
        }
    }

    /// A ping went out. Arms the deadline unless one is already pending.
    pub fn ping_sent(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.pong_timeout);
        }
    }

    /// A pong arrived.
    pub fn pong_received(&mut self) {
        self.deadline = None;
    }

    /// Whether a pong is outstanding.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the pending deadline passes; never completes while
    /// disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Deadline for a socket write starting now: the pending pong deadline,
    /// or one pong timeout from now while disarmed.
    pub fn write_deadline(&self) -> Instant {
        self.deadline.unwrap_or_else(|| Instant::now() + self.pong_timeout)
    }
}

/// [`Watchdog::expired`] for an optional watchdog.
pub(crate) async fn watchdog_expired(watchdog: Option<&Watchdog>) {
    match watchdog {
        Some(w) => w.expired().await,
        None => std::future::pending().await,
    }
}

/// Completes at [`Watchdog::write_deadline`]; never without a watchdog.
pub(crate) async fn write_stalled(watchdog: Option<&Watchdog>) {
    match watchdog {
        Some(w) => tokio::time::sleep_until(w.write_deadline()).await,
        None => std::future::pending().await,
    }
}
