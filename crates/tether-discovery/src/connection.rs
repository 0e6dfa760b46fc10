//! In-memory connections and their discovery-side bookkeeping.

use crate::swarm::NodeState;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tether_core::dedup::should_drop;
use tether_core::{ConnectionInfo, PeerId, Topic, TopicSet};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const TOPIC_CHANNEL_CAPACITY: usize = 64;

/// One side of an in-memory connection as seen by discovery
pub struct LocalConnection {
    me: Weak<LocalConnection>,
    node: Weak<NodeState>,
    remote: PeerId,
    initiator: bool,
    topics: RwLock<TopicSet>,
    topic_tx: broadcast::Sender<Topic>,
    drop_signal: CancellationToken,
    closed: CancellationToken,
}

impl LocalConnection {
    pub(crate) fn new(
        node: &Arc<NodeState>,
        remote: PeerId,
        initiator: bool,
        topic: Option<Topic>,
    ) -> Arc<Self> {
        let (topic_tx, _) = broadcast::channel(TOPIC_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node: Arc::downgrade(node),
            remote,
            initiator,
            topics: RwLock::new(topic.into_iter().collect()),
            topic_tx,
            drop_signal: CancellationToken::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Address of the remote node in the rendezvous
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Whether the socket of this connection was dropped
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Record that this connection also serves `topic`
    pub(crate) fn observe(&self, topic: Topic) {
        if self.topics.write().insert(topic) {
            let _ = self.topic_tx.send(topic);
        }
    }

    /// Socket wrapper that marks this connection closed when dropped
    pub(crate) fn socket(&self, inner: DuplexStream) -> TrackedSocket {
        TrackedSocket {
            inner,
            closed: self.closed.clone(),
        }
    }
}

impl ConnectionInfo for LocalConnection {
    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn deduplicate(&self, local: &PeerId, remote: &PeerId) -> bool {
        let Some(node) = self.node.upgrade() else {
            return true;
        };

        match node.by_key.entry(*remote) {
            Entry::Vacant(entry) => {
                entry.insert(self.me.clone());
                false
            }
            Entry::Occupied(mut entry) => {
                let existing = entry
                    .get()
                    .upgrade()
                    .filter(|existing| !existing.is_closed() && !std::ptr::eq(&**existing, self));
                let Some(existing) = existing else {
                    entry.insert(self.me.clone());
                    return false;
                };

                if should_drop(local, remote, self.initiator) {
                    return true;
                }

                tracing::debug!(
                    "Connection to {} replaces an existing one",
                    hex::encode(&remote[..8])
                );
                entry.insert(self.me.clone());
                existing.drop_signal.cancel();
                false
            }
        }
    }

    fn observed_topics(&self) -> Vec<Topic> {
        self.topics.read().to_vec()
    }

    fn subscribe_topics(&self) -> broadcast::Receiver<Topic> {
        self.topic_tx.subscribe()
    }

    fn drop_signal(&self) -> CancellationToken {
        self.drop_signal.clone()
    }

    fn ban(&self) {
        if let Some(node) = self.node.upgrade() {
            node.ban(self.remote);
        }
    }

    fn backoff(&self) {
        if let Some(node) = self.node.upgrade() {
            node.backoff(self.remote);
        }
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("remote", &hex::encode(&self.remote[..8]))
            .field("initiator", &self.initiator)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Duplex pipe half that reports its own drop
pub(crate) struct TrackedSocket {
    inner: DuplexStream,
    closed: CancellationToken,
}

impl AsyncRead for TrackedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedSocket {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
