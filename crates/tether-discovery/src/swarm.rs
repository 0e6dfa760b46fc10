//! Rendezvous hub and per-node swarm handles.

use crate::config::LocalSwarmConfig;
use crate::connection::LocalConnection;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tether_core::{
    Discovery, IncomingConnection, JoinOptions, PeerId, Result, TetherError, Topic,
};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Membership {
    announcers: HashSet<PeerId>,
    lookups: HashSet<PeerId>,
}

impl Membership {
    fn is_empty(&self) -> bool {
        self.announcers.is_empty() && self.lookups.is_empty()
    }
}

/// Shared meeting point for every node in the process
#[derive(Default)]
pub struct Rendezvous {
    nodes: DashMap<PeerId, Arc<NodeState>>,
    topics: DashMap<Topic, Membership>,
}

impl Rendezvous {
    /// Create an empty rendezvous
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of registered nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, id: &PeerId) -> Option<Arc<NodeState>> {
        self.nodes.get(id).map(|node| Arc::clone(node.value()))
    }

    fn join(&self, node: &Arc<NodeState>, topic: Topic, options: JoinOptions) {
        let (announcers, lookups) = {
            let mut membership = self.topics.entry(topic).or_default();
            if options.announce {
                membership.announcers.insert(node.id);
            } else {
                membership.announcers.remove(&node.id);
            }
            if options.lookup {
                membership.lookups.insert(node.id);
            } else {
                membership.lookups.remove(&node.id);
            }
            (membership.announcers.clone(), membership.lookups.clone())
        };

        if options.lookup {
            for id in announcers.iter().filter(|id| **id != node.id) {
                if let Some(remote) = self.node(id) {
                    dial(node, &remote, topic);
                }
            }
        }
        if options.announce {
            for id in lookups.iter().filter(|id| **id != node.id) {
                if let Some(remote) = self.node(id) {
                    dial(&remote, node, topic);
                }
            }
        }
    }

    fn leave(&self, id: &PeerId, topic: &Topic) {
        let now_empty = match self.topics.get_mut(topic) {
            Some(mut membership) => {
                membership.announcers.remove(id);
                membership.lookups.remove(id);
                membership.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(topic, |_, membership| membership.is_empty());
        }
    }

    fn unregister(&self, id: &PeerId) {
        self.nodes.remove(id);
        self.topics.retain(|_, membership| {
            membership.announcers.remove(id);
            membership.lookups.remove(id);
            !membership.is_empty()
        });
    }
}

/// Per-node state shared with that node's connections
pub(crate) struct NodeState {
    pub(crate) id: PeerId,
    config: LocalSwarmConfig,
    connections: Mutex<Option<mpsc::UnboundedSender<IncomingConnection>>>,
    outbound: DashMap<PeerId, Weak<LocalConnection>>,
    pub(crate) by_key: DashMap<PeerId, Weak<LocalConnection>>,
    banned: DashSet<PeerId>,
    cooldown: DashMap<PeerId, Instant>,
    destroyed: AtomicBool,
}

impl NodeState {
    pub(crate) fn ban(&self, remote: PeerId) {
        tracing::debug!("Banning {}", hex::encode(&remote[..8]));
        self.banned.insert(remote);
    }

    pub(crate) fn backoff(&self, remote: PeerId) {
        self.cooldown.insert(remote, Instant::now() + self.config.backoff);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn blocks(&self, remote: &PeerId) -> bool {
        if self.banned.contains(remote) {
            return true;
        }
        let cooling = self
            .cooldown
            .get(remote)
            .is_some_and(|until| Instant::now() < *until);
        if !cooling {
            self.cooldown.remove(remote);
        }
        cooling
    }

    fn deliver(&self, connection: IncomingConnection) -> bool {
        match self.connections.lock().as_ref() {
            Some(tx) => tx.send(connection).is_ok(),
            None => false,
        }
    }
}

fn dial(from: &Arc<NodeState>, to: &Arc<NodeState>, topic: Topic) {
    if from.is_destroyed() || to.is_destroyed() {
        return;
    }
    if from.blocks(&to.id) || to.blocks(&from.id) {
        tracing::trace!("Skipping dial to {}: banned or backing off", hex::encode(&to.id[..8]));
        return;
    }

    let existing = from.outbound.get(&to.id).and_then(|conn| conn.upgrade());
    if let Some(existing) = existing.filter(|conn| !conn.is_closed()) {
        existing.observe(topic);
        return;
    }

    let (near, far) = tokio::io::duplex(from.config.buffer_size.max(to.config.buffer_size));
    let outgoing = LocalConnection::new(from, to.id, true, Some(topic));
    let incoming = LocalConnection::new(to, from.id, false, None);
    from.outbound.insert(to.id, Arc::downgrade(&outgoing));

    tracing::debug!(
        "Dialing {} -> {} for topic {:?}",
        hex::encode(&from.id[..8]),
        hex::encode(&to.id[..8]),
        topic
    );

    let delivered_out = from.deliver(IncomingConnection {
        socket: Box::new(outgoing.socket(near)),
        info: outgoing,
    });
    let delivered_in = to.deliver(IncomingConnection {
        socket: Box::new(incoming.socket(far)),
        info: incoming,
    });
    if !(delivered_out && delivered_in) {
        tracing::trace!("Dial abandoned, one side stopped accepting");
    }
}

/// One node's handle on a [`Rendezvous`]
pub struct LocalSwarm {
    rendezvous: Arc<Rendezvous>,
    node: Arc<NodeState>,
}

impl LocalSwarm {
    /// Register node `id` and return its handle plus the stream of
    /// connections to hand to the session manager
    pub fn new(
        rendezvous: &Arc<Rendezvous>,
        id: PeerId,
        config: LocalSwarmConfig,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = Arc::new(NodeState {
            id,
            config,
            connections: Mutex::new(Some(tx)),
            outbound: DashMap::new(),
            by_key: DashMap::new(),
            banned: DashSet::new(),
            cooldown: DashMap::new(),
            destroyed: AtomicBool::new(false),
        });
        rendezvous.nodes.insert(id, Arc::clone(&node));

        let swarm = Self {
            rendezvous: Arc::clone(rendezvous),
            node,
        };
        (swarm, rx)
    }

    /// This node's rendezvous address
    pub fn id(&self) -> &PeerId {
        &self.node.id
    }
}

#[async_trait]
impl Discovery for LocalSwarm {
    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<()> {
        if self.node.is_destroyed() {
            return Err(TetherError::discovery("swarm destroyed"));
        }
        self.rendezvous.join(&self.node, topic, options);
        Ok(())
    }

    async fn leave(&self, topic: Topic) -> Result<()> {
        self.rendezvous.leave(&self.node.id, &topic);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.node.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.rendezvous.unregister(&self.node.id);
        self.node.connections.lock().take();
        tracing::debug!("Local swarm node {} destroyed", hex::encode(&self.node.id[..8]));
        Ok(())
    }
}

impl std::fmt::Debug for LocalSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSwarm")
            .field("id", &hex::encode(&self.node.id[..8]))
            .finish_non_exhaustive()
    }
}
