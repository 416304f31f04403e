//! Domain-specific error types for the milter protocol runtime.
//!
//! All fallible operations return `Result<T, MilterError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the milter runtime.
#[derive(Debug, Error)]
pub enum MilterError {
    // ── Protocol violations ──────────────────────────────────────
    /// Framing length out of range (0 or beyond the 64 KiB bound).
    #[error("protocol violation (packet): {0}")]
    ProtocolViolationPacket(String),

    /// Unknown command discriminator, or an empty payload.
    #[error("protocol violation (payload): {0}")]
    ProtocolViolationPayload(String),

    /// Malformed data for a known command discriminator.
    #[error("protocol violation (command data): {0}")]
    ProtocolViolationCommandData(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// The application's hook/flag configuration is contradictory.
    #[error("programming error: {0}")]
    ProgrammingError(String),

    /// A response failed validation at construction time.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Application Errors ───────────────────────────────────────
    /// An application callback failed.
    #[error("application error: {0}")]
    App(String),
}

impl MilterError {
    /// Whether this error is a wire-protocol violation observed from the
    /// MTA. Violations trigger a bottom-up close without any reply.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolationPacket(_)
                | Self::ProtocolViolationPayload(_)
                | Self::ProtocolViolationCommandData(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for MilterError {
    fn from(s: String) -> Self {
        MilterError::App(s)
    }
}

impl From<&str> for MilterError {
    fn from(s: &str) -> Self {
        MilterError::App(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MilterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MilterError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = MilterError::ProtocolViolationPacket("length 0".into());
        assert!(e.to_string().contains("packet"));

        let e = MilterError::InvalidResponse("bad header name".into());
        assert!(e.to_string().contains("bad header name"));
    }

    #[test]
    fn violation_classification() {
        assert!(MilterError::ProtocolViolationPayload("x".into()).is_protocol_violation());
        assert!(MilterError::ProtocolViolationCommandData("x".into()).is_protocol_violation());
        assert!(!MilterError::ChannelClosed.is_protocol_violation());
    }

    #[test]
    fn from_string() {
        let e: MilterError = "hook failed".into();
        assert!(matches!(e, MilterError::App(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: MilterError = io_err.into();
        assert!(matches!(e, MilterError::Connection(_)));
    }
}
