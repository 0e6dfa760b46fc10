//! Topic metadata exchange.
//!
//! Right after the multiplexer comes up, both sides open the reserved shared
//! stream [`CONTROL_STREAM`], write their topic announcement, end their write
//! side, and read the remote's announcement to completion:
//!
//! ```text
//!   local                         remote
//!     │── Open(shared "tether/topics") ──►│
//!     │── Data(announcement) ────────────►│
//!     │── End ───────────────────────────►│
//!     │◄─────────── Open / Data / End ────│
//! ```
//!
//! The peer becomes ready only after both the write and the read completed.

use crate::error::{Result, TetherError};
use crate::topic::Topic;
use bincode::Options;
use serde::{Deserialize, Serialize};
use tether_mux::{MuxError, Multiplexer};

/// Reserved shared stream carrying topic announcements
pub const CONTROL_STREAM: &str = "tether/topics";

/// Whether `name` is reserved for session control traffic
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name == CONTROL_STREAM
}

/// Topics a node declares to its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAnnouncement {
    /// Announced topics in the sender's order
    pub topics: Vec<Topic>,
}

impl TopicAnnouncement {
    /// Serialize, refusing announcements over `max_topics`
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Serialization`] if the announcement is too large.
    pub fn encode(&self, max_topics: usize) -> Result<Vec<u8>> {
        if self.topics.len() > max_topics {
            return Err(TetherError::Serialization(
                format!("{} topics exceeds limit of {}", self.topics.len(), max_topics).into(),
            ));
        }
        Ok(codec(max_topics).serialize(self)?)
    }

    /// Parse a remote announcement
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] for truncated, oversized, or
    /// otherwise malformed input.
    pub fn decode(bytes: &[u8], max_topics: usize) -> Result<Self> {
        let announcement: Self = codec(max_topics)
            .deserialize(bytes)
            .map_err(|e| TetherError::Protocol(format!("bad topic announcement: {e}").into()))?;
        if announcement.topics.len() > max_topics {
            return Err(TetherError::protocol("too many topics announced"));
        }
        Ok(announcement)
    }
}

/// Encoded size bound for an announcement of `max_topics` topics
#[must_use]
pub fn announcement_limit(max_topics: usize) -> usize {
    // varint length prefix plus the topics themselves
    9 + max_topics.saturating_mul(32)
}

fn codec(max_topics: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(announcement_limit(max_topics) as u64)
        .reject_trailing_bytes()
}

/// Send `local` topics and return the remote's announced topics
///
/// # Errors
///
/// Returns [`TetherError::Protocol`] if the remote's announcement is
/// malformed and [`TetherError::Transport`] if the session died first.
pub async fn exchange(mux: &Multiplexer, local: &[Topic], max_topics: usize) -> Result<Vec<Topic>> {
    let payload = TopicAnnouncement {
        topics: local.to_vec(),
    }
    .encode(max_topics)?;

    let mut stream = mux.shared(CONTROL_STREAM)?;
    stream.write(&payload)?;
    stream.end();

    let bytes = stream
        .read_to_end(announcement_limit(max_topics))
        .await
        .map_err(|e| match e {
            MuxError::PayloadTooLarge { .. } => TetherError::protocol("topic announcement too large"),
            MuxError::SessionClosed => TetherError::transport("session closed during metadata exchange"),
            other => other.into(),
        })?;

    let announcement = TopicAnnouncement::decode(&bytes, max_topics)?;
    tracing::trace!("Remote announced {} topics", announcement.topics.len());
    Ok(announcement.topics)
}
