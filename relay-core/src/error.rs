//! Domain-specific error types for the relay.
//!
//! All fallible operations return `Result<T, RelayError>`.
//! Invalid input never panics; every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Beacon Errors ────────────────────────────────────────────
    /// A string is too long for the 16-bit length prefix.
    #[error("encoding error: {len} bytes does not fit a 16-bit length prefix")]
    Encoding { len: usize },

    /// A beacon packet declared more bytes than it carries.
    #[error("truncated packet: need {needed} bytes, got {available}")]
    TruncatedPacket { needed: usize, available: usize },

    // ── Framing Errors ───────────────────────────────────────────
    /// Received bytes that do not start with the relay magic sequence.
    #[error("invalid magic bytes: expected RLY0")]
    InvalidMagic,

    /// A field in the frame header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The received frame is shorter or longer than its header says.
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly, usually because the
    /// session went away.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    // ── Session Errors ───────────────────────────────────────────
    /// The remote side answered a call with a fault.
    #[error("remote fault in {method}: {message}")]
    Remote { method: String, message: String },

    /// The remote side answered with a frame that does not fit the call.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ── Settings Errors ──────────────────────────────────────────
    /// The settings store could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Returns `true` for failures caused by the session going away or
    /// not answering, rather than by what was said on it. Cancelling a
    /// call counts, since the reply never arrives.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RelayError::Connection(_) | RelayError::ChannelClosed | RelayError::Timeout(_) | RelayError::Cancelled
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for RelayError {
    fn from(s: String) -> Self {
        RelayError::Other(s)
    }
}

impl From<&str> for RelayError {
    fn from(s: &str) -> Self {
        RelayError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for RelayError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Settings(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout(Duration::ZERO)
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RelayError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = RelayError::TruncatedPacket {
            needed: 12,
            available: 4,
        };
        assert!(e.to_string().contains("12"));
        assert!(e.to_string().contains('4'));
    }

    #[test]
    fn from_string() {
        let e: RelayError = "something broke".into();
        assert!(matches!(e, RelayError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RelayError = io_err.into();
        assert!(matches!(e, RelayError::Connection(_)));
        assert!(e.is_disconnect());
    }

    #[test]
    fn remote_fault_is_not_a_disconnect() {
        let e = RelayError::Remote {
            method: "ListTrackingDevices".into(),
            message: "boom".into(),
        };
        assert!(!e.is_disconnect());
        assert!(e.to_string().contains("ListTrackingDevices"));
    }
}
