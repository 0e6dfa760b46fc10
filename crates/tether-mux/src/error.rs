//! Error types for the multiplexer.

use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// Malformed frame received or produced
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Secure channel failure
    #[error("channel error: {0}")]
    Channel(#[from] tether_crypto::CryptoError),

    /// A stream with this name is already open in the same namespace
    #[error("stream already exists: {0}")]
    StreamExists(String),

    /// Write attempted after the local side ended the stream
    #[error("stream ended")]
    StreamEnded,

    /// Remote aborted the stream
    #[error("stream reset by remote")]
    StreamReset,

    /// Stream contents exceeded the caller's limit
    #[error("stream payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Maximum accepted size
        limit: usize,
    },

    /// The session is closed
    #[error("session closed")]
    SessionClosed,
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Invalid frame type byte
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Invalid namespace byte
    #[error("invalid namespace: 0x{0:02X}")]
    InvalidNamespace(u8),

    /// Stream name longer than the protocol allows
    #[error("stream name too long: {0} bytes")]
    NameTooLong(usize),

    /// Stream name is not valid UTF-8
    #[error("stream name is not valid UTF-8")]
    InvalidName,

    /// Payload exceeds the maximum frame payload
    #[error("payload length exceeds maximum")]
    PayloadOverflow,

    /// Non-data frame carries a payload
    #[error("unexpected payload on frame type 0x{0:02X}")]
    UnexpectedPayload(u8),
}
