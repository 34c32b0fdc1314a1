//! Error taxonomy for the messaging client.
//!
//! Close events are not errors: a transport closing is a normal state
//! transition reported through close handlers. Errors here are returned from
//! calls that could not be carried out.

use thiserror::Error;

/// Errors returned by sessions, transports and publishers.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The call is not allowed in the current lifecycle state
    /// (initialized twice, or used after termination).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No open connection is available for the request. Not queued; the
    /// caller retries later.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The connection could not be established (handshake failure, DNS,
    /// refused, connect timeout).
    #[error("connection failed: {0}")]
    Connection(String),

    /// A frame could not be written to an open connection.
    #[error("send failed: {0}")]
    Send(String),

    /// A request could not be serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An HTTP publish request failed or returned a non-success status.
    #[error("http request failed: {message}")]
    Http {
        /// Response status, when a response was received.
        status: Option<u16>,
        /// Error description.
        message: String,
    },
}

/// Result alias for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// Whether retrying the same call later can succeed without any change
    /// by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotReady(_) | Self::Connection(_) | Self::Send(_) => true,
            Self::Http { status, .. } => status.is_none_or(|s| s >= 500 || s == 429),
            Self::InvalidState(_) | Self::Codec(_) => false,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "invalid_state",
            Self::NotReady(_) => "not_ready",
            Self::Connection(_) => "connection",
            Self::Send(_) => "send",
            Self::Codec(_) => "codec",
            Self::Http { .. } => "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn display_messages() {
        let err = MessagingError::NotReady("no active transport".into());
        assert_eq!(err.to_string(), "not ready: no active transport");

        let err = MessagingError::Http {
            status: Some(502),
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "http request failed: bad gateway");
    }

    #[test]
    fn retryable_classification() {
        assert!(MessagingError::NotReady("x".into()).is_retryable());
        assert!(MessagingError::Connection("refused".into()).is_retryable());
        assert!(MessagingError::Send("broken pipe".into()).is_retryable());
        assert!(
            MessagingError::Http {
                status: Some(503),
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(
            MessagingError::Http {
                status: None,
                message: "timeout".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn not_retryable_classification() {
        assert!(!MessagingError::InvalidState("terminated".into()).is_retryable());
        assert!(
            !MessagingError::Http {
                status: Some(400),
                message: "bad request".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn codec_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: MessagingError = json_err.into();
        assert_matches!(err, MessagingError::Codec(_));
        assert_eq!(err.error_kind(), "codec");
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(MessagingError::InvalidState("x".into()).error_kind(), "invalid_state");
        assert_eq!(MessagingError::NotReady("x".into()).error_kind(), "not_ready");
        assert_eq!(MessagingError::Connection("x".into()).error_kind(), "connection");
    }
}
