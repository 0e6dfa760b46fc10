//! Discovery collaborator boundary.
//!
//! Discovery finds peers for topics and hands over already-connected raw
//! sockets together with a [`ConnectionInfo`] describing what it knows about
//! each connection. The session manager never dials anything itself.

use crate::error::Result;
use crate::identity::PeerId;
use crate::topic::Topic;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A connected, reliable, ordered byte stream
pub trait RawSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawSocket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased raw socket
pub type BoxedSocket = Box<dyn RawSocket>;

/// How to participate in a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Make this node discoverable under the topic
    pub announce: bool,
    /// Actively connect to nodes announcing the topic
    pub lookup: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
        }
    }
}

impl JoinOptions {
    /// Announce without looking up
    #[must_use]
    pub const fn announce_only() -> Self {
        Self {
            announce: true,
            lookup: false,
        }
    }

    /// Look up without announcing
    #[must_use]
    pub const fn lookup_only() -> Self {
        Self {
            announce: false,
            lookup: true,
        }
    }
}

/// What discovery knows about one connection
pub trait ConnectionInfo: Send + Sync {
    /// Whether the local node dialed this connection
    fn is_initiator(&self) -> bool;

    /// Register this connection as going to `remote`; returns true when it
    /// lost the duplicate tie-break and must be closed
    fn deduplicate(&self, local: &PeerId, remote: &PeerId) -> bool;

    /// Topics this connection was found through so far
    fn observed_topics(&self) -> Vec<Topic>;

    /// Topics observed on this connection from now on
    fn subscribe_topics(&self) -> broadcast::Receiver<Topic>;

    /// Cancelled when discovery wants the connection gone, e.g. after a
    /// newer duplicate won the tie-break
    fn drop_signal(&self) -> CancellationToken;

    /// Never connect to this remote again
    fn ban(&self);

    /// Temporarily avoid reconnecting to this remote
    fn backoff(&self);
}

/// A raw connection handed over by discovery
pub struct IncomingConnection {
    /// Connected socket
    pub socket: BoxedSocket,
    /// Discovery's view of the connection
    pub info: Arc<dyn ConnectionInfo>,
}

impl std::fmt::Debug for IncomingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingConnection")
            .field("initiator", &self.info.is_initiator())
            .finish_non_exhaustive()
    }
}

/// Topic membership operations offered by discovery
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Join `topic`; resolves once discovery acknowledged the membership
    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<()>;

    /// Leave `topic`
    async fn leave(&self, topic: Topic) -> Result<()>;

    /// Stop discovery and release all of its resources
    async fn destroy(&self) -> Result<()>;
}
