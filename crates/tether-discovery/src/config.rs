//! Local swarm configuration

use std::time::Duration;

/// Local swarm configuration
#[derive(Debug, Clone)]
pub struct LocalSwarmConfig {
    /// In-memory pipe buffer per direction
    pub buffer_size: usize,

    /// How long `backoff()` keeps a remote from being dialed again
    pub backoff: Duration,
}

impl Default for LocalSwarmConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            backoff: Duration::from_secs(1),
        }
    }
}
