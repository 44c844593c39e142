//! Error types for capture and supervision.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while capturing from a single stream.
///
/// None of these leave the stream's own task except through its health
/// snapshot; they drive the reconnection state machine instead.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Opening or reading the connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The connection looks open but no frame arrived in time
    #[error("No frame received for {0:?}")]
    Stale(Duration),

    /// Every allowed reconnect attempt failed
    #[error("Gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    /// No backend is compiled in for this URL
    #[error("Unsupported stream URL: {0}")]
    Unsupported(String),
}

impl CaptureError {
    /// Whether this error should tear the connection down and reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, CaptureError::Decode(_))
    }
}

/// Errors surfaced by the supervisor to its caller
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No streams configured")]
    NoStreams,

    #[error("No stream could be started: {0}")]
    StartFailed(String),

    #[error("Unknown stream id {0}")]
    UnknownStream(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_survivable() {
        assert!(!CaptureError::Decode("bad nal".into()).is_connection_fatal());
        assert!(CaptureError::Connection("refused".into()).is_connection_fatal());
        assert!(CaptureError::Stale(Duration::from_secs(5)).is_connection_fatal());
        assert!(CaptureError::Unsupported("ftp://x".into()).is_connection_fatal());
    }
}
