//! Domain-specific error types for the relay.
//!
//! Fallible operations return `Result<T, RelayError>` or one of the
//! narrower component errors (`HookError`, `ConnectError`, `SendError`).
//! None of them panic on invalid input; every error is typed so callers
//! can decide between retrying, tearing down, or giving up.

use std::time::Duration;
use thiserror::Error;

use crate::hook::Symbol;

/// The canonical error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the relay magic sequence.
    #[error("invalid magic bytes: expected HKR1")]
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

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// A frame violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Frame Errors ─────────────────────────────────────────────
    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The received frame is shorter or longer than its header claims.
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

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

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Hook Errors ──────────────────────────────────────────────
    #[error(transparent)]
    Hook(#[from] HookError),

    // ── Session Errors ───────────────────────────────────────────
    /// The session is no longer open.
    #[error("session {0} is closed")]
    SessionClosed(u64),

    /// The helper answered a call with an error reply.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Hook errors ───────────────────────────────────────────────────

/// Why a hook could not be installed. Never retryable for the same target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookInstallError {
    /// The dispatch table has no entry point for the symbol.
    #[error("symbol {0} is not present in the dispatch table")]
    UnknownSymbol(Symbol),

    /// The calling convention or signature cannot be trampolined.
    #[error("unsupported signature for {symbol}: {reason}")]
    UnsupportedSignature { symbol: Symbol, reason: String },

    /// This table already owns a hook on the symbol.
    #[error("{0} is already hooked")]
    AlreadyHooked(Symbol),

    /// The slot changed between resolution and patch; nothing was written.
    #[error("dispatch slot for {0} changed during install")]
    SlotChanged(Symbol),
}

/// The hook entry is unknown to the table or was already removed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no installed hook for {symbol} (id {id})")]
pub struct HookNotFoundError {
    pub symbol: Symbol,
    pub id: u64,
}

/// Errors raised by the API hook table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error(transparent)]
    Install(#[from] HookInstallError),

    #[error(transparent)]
    NotFound(#[from] HookNotFoundError),

    /// The original entry point could not be put back because something
    /// else replaced the trampoline. The entry is marked `Failed`.
    #[error("could not restore original entry point for {symbol}")]
    RestoreFailed { symbol: Symbol },
}

// ── Transport errors ──────────────────────────────────────────────

/// Failure to open a channel to the controller.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint actively refused the connection.
    #[error("connection to {endpoint} refused")]
    Refused { endpoint: String },

    /// No connection within the configured deadline.
    #[error("connect to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    /// Any other socket-level failure.
    #[error("connect to {endpoint} failed: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer connected but the opening exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Failure to hand a message to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Backpressure outlasted the send deadline; the caller may retry.
    #[error("send timed out after {0:?}; retry-eligible")]
    Transient(Duration),

    /// The channel cannot carry any more traffic and is now `Broken`.
    #[error("channel is broken: {0}")]
    Fatal(String),
}

impl SendError {
    /// Returns `true` if the channel must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::Fatal(_))
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
        RelayError::Encoding(e.to_string())
    }
}

impl From<HookInstallError> for RelayError {
    fn from(e: HookInstallError) -> Self {
        RelayError::Hook(HookError::Install(e))
    }
}

impl From<HookNotFoundError> for RelayError {
    fn from(e: HookNotFoundError) -> Self {
        RelayError::Hook(HookError::NotFound(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RelayError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = RelayError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
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
    }

    #[test]
    fn hook_errors_nest() {
        let e: RelayError = HookInstallError::AlreadyHooked(Symbol::new("GetFocus")).into();
        assert!(matches!(e, RelayError::Hook(HookError::Install(_))));
        assert!(e.to_string().contains("GetFocus"));
    }

    #[test]
    fn send_error_fatality() {
        assert!(SendError::Fatal("eof".into()).is_fatal());
        assert!(!SendError::Transient(Duration::from_millis(5)).is_fatal());
    }
}
