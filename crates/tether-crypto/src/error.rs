//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Remote did not present a usable static key
    #[error("invalid remote static key")]
    InvalidRemoteKey,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Plaintext does not fit in a single transport message
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Offered plaintext size
        size: usize,
        /// Maximum plaintext size
        max: usize,
    },

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Peer closed the stream in the middle of a message
    #[error("connection closed mid-message")]
    UnexpectedEof,

    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<snow::Error> for CryptoError {
    fn from(err: snow::Error) -> Self {
        CryptoError::Handshake(err.to_string())
    }
}
