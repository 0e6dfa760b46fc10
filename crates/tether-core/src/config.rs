//! Session manager configuration

use crate::error::{Result, TetherError};
use std::time::Duration;

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct TetherConfig {
    /// Announce this node under its own public key so `find_by_public_key`
    /// on other nodes can reach it
    pub listen_self: bool,

    /// Upper bound on the Noise handshake
    pub handshake_timeout: Duration,

    /// Upper bound on the topic metadata exchange
    pub exchange_timeout: Duration,

    /// Upper bound on a graceful session close before it is aborted
    pub close_timeout: Duration,

    /// Delay before an idle peer disconnects; zero waits a single scheduling turn
    pub idle_grace: Duration,

    /// Most topics accepted in a remote announcement
    pub max_topics: usize,

    /// Capacity of each broadcast event channel
    pub event_capacity: usize,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            listen_self: true,
            handshake_timeout: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            idle_grace: Duration::ZERO,
            max_topics: 1024,
            event_capacity: 256,
        }
    }
}

impl TetherConfig {
    /// Check the configuration for values the manager cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout.is_zero() {
            return Err(TetherError::invalid_config("handshake_timeout must be non-zero"));
        }
        if self.exchange_timeout.is_zero() {
            return Err(TetherError::invalid_config("exchange_timeout must be non-zero"));
        }
        if self.close_timeout.is_zero() {
            return Err(TetherError::invalid_config("close_timeout must be non-zero"));
        }
        if self.max_topics == 0 {
            return Err(TetherError::invalid_config("max_topics must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(TetherError::invalid_config("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TetherConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.listen_self);
        assert!(config.idle_grace.is_zero());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = TetherConfig {
            exchange_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TetherError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = TetherConfig {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
