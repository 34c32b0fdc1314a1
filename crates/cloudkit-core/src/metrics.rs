//! Metrics sink contract and the metric names emitted by the client.

/// Time from socket creation to the open event (ms).
pub const OPEN_MESSAGE_WS_LATENCY: &str = "OpenMessageWsLatency";
/// Time from publish to local delivery (ms).
pub const TOTAL_MESSAGE_LATENCY: &str = "TotalMessageLatency";
/// Time from relay forward to local delivery (ms).
pub const FORWARD_MESSAGE_LATENCY: &str = "ForwardMessageLatency";
/// Socket or handshake errors.
pub const WS_ERROR_COUNT: &str = "WsErrorCount";
/// Prefix of the per-code close counter, e.g. `WsCloseCount1006`.
pub const WS_CLOSE_COUNT_PREFIX: &str = "WsCloseCount";
/// Session observed a 1006 close and reconnected.
pub const ABNORMAL_CLOSE_COUNT: &str = "AbnormalCloseCount";
/// Session observed any other close it did not request and reconnected.
pub const UNDESIRED_CLOSE_COUNT: &str = "UndesiredCloseCount";

/// Name of the close counter for `code`.
pub fn ws_close_count(code: u16) -> String {
    format!("{WS_CLOSE_COUNT_PREFIX}{code}")
}

/// Sink for named timers and counters.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// connection read loop.
pub trait Metrics: Send + Sync {
    /// Record a duration in milliseconds.
    fn time(&self, name: &str, millis: i64);

    /// Increment a counter by one.
    fn increment_counter(&self, name: &str);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn time(&self, _name: &str, _millis: i64) {}

    fn increment_counter(&self, _name: &str) {}
}
