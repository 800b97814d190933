//! Error types for the wire protocol and the caller-side bridge.
//!
//! Protocol errors are fatal for the connection they occurred on: a peer
//! that sends a malformed frame is closed rather than resynchronized.
//! Client errors are what callers of [`crate::client::IpcClient`] see.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unsupported compression algorithm: {0}")]
    UnsupportedCompression(String),

    #[error("decompressed payload exceeds {cap} bytes")]
    DecompressBomb { cap: usize },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("invalid JSON in {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers issuing requests through the async bridge.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,

    /// The pending-request table is at capacity.
    #[error("too many pending requests")]
    Overloaded,

    /// The transport dropped before the response arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer answered with an error response.
    #[error("remote error: {message}")]
    Remote {
        /// Stable code from the response metadata, empty when absent.
        code: String,
        message: String,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether a fresh attempt could plausibly succeed (Lazy Pirate retry).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
