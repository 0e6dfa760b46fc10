//! Error types for Tether sessions
//!
//! Errors are categorized to support caller-side retry decisions. Nothing in
//! this crate retries on its own.
//!
//! # Error Categories
//!
//! - **Transient**: the remote or the network misbehaved; a new session may succeed
//! - **Permanent**: caller misuse or a destroyed manager; retrying will not help
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{Result, TetherError};
//!
//! fn handle_error(err: TetherError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use std::borrow::Cow;
use tether_crypto::CryptoError;
use tether_mux::MuxError;
use thiserror::Error;

/// Errors that can occur in session operations
#[derive(Debug, Error, Clone)]
pub enum TetherError {
    /// Noise handshake failed or the remote key was unusable
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Remote sent malformed session metadata
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Underlying socket or multiplexer failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Operation not allowed in the current peer state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Stream could not be opened or claimed
    #[error("Stream error: {0}")]
    Stream(Cow<'static, str>),

    /// Discovery collaborator failed
    #[error("Discovery error: {0}")]
    Discovery(Cow<'static, str>),

    /// The session manager was destroyed
    #[error("Session manager destroyed")]
    Destroyed,

    /// Internal channel closed unexpectedly
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl TetherError {
    /// Returns true if this error is transient and a new session may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TetherError::Timeout(_)
                | TetherError::Transport(_)
                | TetherError::Handshake(_)
                | TetherError::Channel(_)
                | TetherError::Discovery(_)
        )
    }

    /// Returns true if this error will not go away on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TetherError::InvalidConfig(_)
                | TetherError::InvalidState(_)
                | TetherError::Destroyed
                | TetherError::Protocol(_)
        )
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        TetherError::Handshake(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        TetherError::Protocol(Cow::Borrowed(context))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        TetherError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        TetherError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        TetherError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        TetherError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a stream error with static context (zero allocation)
    #[must_use]
    pub const fn stream(context: &'static str) -> Self {
        TetherError::Stream(Cow::Borrowed(context))
    }

    /// Create a discovery error with static context (zero allocation)
    #[must_use]
    pub const fn discovery(context: &'static str) -> Self {
        TetherError::Discovery(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for TetherError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Handshake(_) | CryptoError::InvalidRemoteKey => {
                TetherError::Handshake(Cow::Owned(err.to_string()))
            }
            _ => TetherError::Transport(Cow::Owned(err.to_string())),
        }
    }
}

impl From<MuxError> for TetherError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::StreamExists(_) | MuxError::StreamEnded | MuxError::StreamReset => {
                TetherError::Stream(Cow::Owned(err.to_string()))
            }
            MuxError::PayloadTooLarge { .. } => TetherError::Protocol(Cow::Owned(err.to_string())),
            MuxError::SessionClosed => TetherError::invalid_state("session closed"),
            MuxError::Frame(_) | MuxError::Channel(_) => {
                TetherError::Transport(Cow::Owned(err.to_string()))
            }
        }
    }
}

impl From<bincode::Error> for TetherError {
    fn from(err: bincode::Error) -> Self {
        TetherError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, TetherError>;
