//! Registry of live peers keyed by session id.

use crate::identity::PeerId;
use crate::peer::Peer;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set of live peers
#[derive(Default)]
pub(crate) struct Registry {
    peers: DashMap<u64, Arc<Peer>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve a session id for a new connection
    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.session_id(), peer);
    }

    pub(crate) fn remove(&self, session_id: u64) -> Option<Arc<Peer>> {
        self.peers.remove(&session_id).map(|(_, peer)| peer)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Copy out the current peers so callers never iterate the live map
    pub(crate) fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// First peer matching `predicate`
    pub(crate) fn find(&self, mut predicate: impl FnMut(&Peer) -> bool) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn find_ready(&self, key: &PeerId) -> Option<Arc<Peer>> {
        self.find(|peer| peer.is_ready() && peer.public_key() == key)
    }
}
