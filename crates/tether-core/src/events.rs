//! Session and peer events.

use crate::error::TetherError;
use crate::peer::Peer;
use crate::topic::Topic;
use std::sync::Arc;

/// Manager-wide events
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer finished its metadata exchange and accepts streams
    PeerReady(Arc<Peer>),
    /// A ready peer gained a topic after becoming ready
    TopicAdded {
        /// Peer that gained the topic
        peer: Arc<Peer>,
        /// The new topic
        topic: Topic,
    },
    /// A connection failed after authentication but before it became ready
    Error(TetherError),
}

/// Per-peer events
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// An application stream opened on either side
    StreamOpened {
        /// Stream name
        name: String,
    },
    /// The peer is now known to be in `topic`
    TopicAdded(Topic),
    /// The session failed; `Disconnected` follows
    Error(TetherError),
    /// The session is gone; emitted exactly once
    Disconnected,
}
