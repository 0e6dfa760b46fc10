//! Session manager: turns raw connections from discovery into ready peers.
//!
//! Every connection runs through one pipeline task:
//!
//! ```text
//! raw socket ──► Noise XX ──► dedup ──► multiplexer ──► Peer (registered)
//!                                                         │
//!                      PeerReady ◄── Ready ◄── topic exchange
//! ```
//!
//! A connection that fails before the topic exchange is dropped silently
//! (logged only). Protocol violations and timeouts during the exchange are
//! reported as [`SessionEvent::Error`]; a remote or discovery hanging up
//! mid-exchange is not. Once ready, the peer's own driver takes over.

use crate::config::TetherConfig;
use crate::discovery::{Discovery, IncomingConnection, JoinOptions};
use crate::error::{Result, TetherError};
use crate::events::SessionEvent;
use crate::identity::{Identity, PeerId};
use crate::metadata::exchange;
use crate::peer::{Peer, PeerInit};
use crate::registry::Registry;
use crate::topic::{Topic, TopicSet};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_crypto::SecureChannel;
use tether_mux::Multiplexer;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Session manager handle; clones share the same node
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    identity: Identity,
    config: Arc<TetherConfig>,
    discovery: Arc<dyn Discovery>,
    registry: Arc<Registry>,
    topics: RwLock<TopicSet>,
    lookups: SyncMutex<TopicClaims>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    destroyed: AtomicBool,
    destroy_result: watch::Sender<Option<Result<()>>>,
}

impl SessionManager {
    /// Create a manager serving the connections discovery delivers on
    /// `connections`.
    ///
    /// With `listen_self` enabled the node announces itself under its own
    /// public key before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::InvalidConfig`] for a bad configuration and any
    /// error from the initial discovery join.
    pub async fn new(
        identity: Identity,
        config: TetherConfig,
        discovery: Arc<dyn Discovery>,
        connections: mpsc::UnboundedReceiver<IncomingConnection>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (destroy_result, _) = watch::channel(None);
        let inner = Arc::new(ManagerInner {
            identity,
            config: Arc::new(config),
            discovery,
            registry: Arc::new(Registry::new()),
            topics: RwLock::new(TopicSet::new()),
            lookups: SyncMutex::new(TopicClaims::default()),
            events,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            destroyed: AtomicBool::new(false),
            destroy_result,
        });

        inner.tasks.spawn(accept_loop(
            Arc::downgrade(&inner),
            connections,
            inner.shutdown.clone(),
        ));

        let public_key = *inner.identity.public_key();
        if inner.config.listen_self {
            inner
                .discovery
                .join(Topic::from(public_key), JoinOptions::announce_only())
                .await?;
        }

        tracing::info!(
            "Session manager started with public key {}",
            hex::encode(&public_key[..8])
        );
        Ok(Self { inner })
    }

    /// Create a manager with a freshly generated identity
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub async fn with_random_identity(
        config: TetherConfig,
        discovery: Arc<dyn Discovery>,
        connections: mpsc::UnboundedReceiver<IncomingConnection>,
    ) -> Result<Self> {
        Self::new(Identity::generate(), config, discovery, connections).await
    }

    /// This node's public key
    pub fn public_key(&self) -> &PeerId {
        self.inner.identity.public_key()
    }

    /// Subscribe to manager-wide events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Topics this node announces to its peers
    pub fn topics(&self) -> Vec<Topic> {
        self.inner.topics.read().to_vec()
    }

    /// All live peers, ready or not
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.registry.snapshot()
    }

    /// Peers that accept streams
    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.peers().into_iter().filter(|peer| peer.is_ready()).collect()
    }

    /// Number of live peers
    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Join `topic` and announce it to future peers
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Destroyed`] after [`Self::destroy`],
    /// [`TetherError::InvalidState`] past the topic limit, and any discovery
    /// error.
    pub async fn join(&self, topic: Topic, options: JoinOptions) -> Result<()> {
        self.join_topic(topic, options, true).await
    }

    /// Leave `topic`
    ///
    /// While a topic lookup is still waiting on `topic` it stays joined and
    /// is left once the last such lookup resolves.
    ///
    /// # Errors
    ///
    /// Returns any discovery error.
    pub async fn leave(&self, topic: Topic) -> Result<()> {
        {
            let mut lookups = self.inner.lookups.lock();
            lookups.explicit.remove(&topic);
            if lookups.pending.contains_key(&topic) {
                tracing::debug!("Topic {:?} kept for a running lookup", topic);
                return Ok(());
            }
            self.inner.topics.write().remove(&topic);
        }
        tracing::debug!("Leaving topic {:?}", topic);
        self.inner.discovery.leave(topic).await
    }

    async fn join_topic(&self, topic: Topic, options: JoinOptions, explicit: bool) -> Result<()> {
        self.ensure_live()?;
        {
            let mut lookups = self.inner.lookups.lock();
            let mut topics = self.inner.topics.write();
            if !topics.contains(&topic) && topics.len() >= self.inner.config.max_topics {
                return Err(TetherError::invalid_state("topic limit reached"));
            }
            topics.insert(topic);
            if explicit {
                lookups.explicit.insert(topic);
            }
        }
        tracing::debug!("Joining topic {:?} ({:?})", topic, options);
        self.inner.discovery.join(topic, options).await
    }

    /// Find a ready peer with `public_key` that is in `topic`, joining the
    /// topic and waiting for one if none is connected yet.
    ///
    /// There is no built-in timeout; wrap the call in
    /// `tokio::time::timeout` to bound it. Unless it is joined explicitly
    /// with [`Self::join`] before or during the wait, the topic is left
    /// again in the background once the last lookup on it ends.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Destroyed`] if the manager is destroyed while
    /// waiting, and any error from joining.
    pub async fn find_by_topic_and_public_key(
        &self,
        topic: Topic,
        public_key: &PeerId,
        options: JoinOptions,
    ) -> Result<Arc<Peer>> {
        self.ensure_live()?;
        let matches =
            |peer: &Peer| peer.is_ready() && peer.public_key() == public_key && peer.has_topic(&topic);

        let mut events = self.subscribe();
        if let Some(peer) = self.inner.registry.find(matches) {
            return Ok(peer);
        }

        let _lookup = TopicLookup::begin(Arc::clone(&self.inner), topic);
        self.join_topic(topic, options, false).await?;
        self.wait_for_peer(&mut events, matches).await
    }

    /// Find a ready peer by public key alone.
    ///
    /// Looks the key up as a topic without announcing, so it reaches nodes
    /// that run with `listen_self`. No built-in timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Destroyed`] if the manager is destroyed while
    /// waiting, and any error from joining.
    pub async fn find_by_public_key(&self, public_key: &PeerId) -> Result<Arc<Peer>> {
        self.ensure_live()?;
        let matches = |peer: &Peer| peer.is_ready() && peer.public_key() == public_key;

        let mut events = self.subscribe();
        if let Some(peer) = self.inner.registry.find_ready(public_key) {
            return Ok(peer);
        }

        let topic = Topic::from(public_key);
        self.inner
            .discovery
            .join(topic, JoinOptions::lookup_only())
            .await?;

        let peer = self.wait_for_peer(&mut events, matches).await?;
        if let Err(e) = self.inner.discovery.leave(topic).await {
            tracing::warn!("Failed to leave lookup for {}: {}", hex::encode(&public_key[..8]), e);
        }
        Ok(peer)
    }

    /// Shut the node down.
    ///
    /// Stops accepting connections, cancels in-flight handshakes, exchanges
    /// and lookups, disconnects every peer, then destroys discovery.
    /// Idempotent; later callers observe the first call's outcome.
    ///
    /// # Errors
    ///
    /// Returns the error from destroying discovery.
    pub async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        let mut outcome = inner.destroy_result.subscribe();

        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return match outcome.wait_for(Option::is_some).await {
                Ok(result) => (*result).clone().unwrap_or(Ok(())),
                Err(_) => Ok(()),
            };
        }

        tracing::info!("Destroying session manager");
        inner.shutdown.cancel();

        let mut disconnects = JoinSet::new();
        for peer in inner.registry.snapshot() {
            disconnects.spawn(async move { peer.disconnect().await });
        }
        while let Some(joined) = disconnects.join_next().await {
            if let Ok(Err(e)) = joined {
                tracing::debug!("Peer disconnect during destroy: {}", e);
            }
        }

        inner.tasks.close();
        inner.tasks.wait().await;

        // Pipelines that registered after the snapshot disconnect themselves,
        // this only catches stragglers
        for peer in inner.registry.snapshot() {
            let _ = peer.disconnect().await;
        }

        let result = inner.discovery.destroy().await;
        inner.destroy_result.send_replace(Some(result.clone()));
        tracing::info!("Session manager destroyed");
        result
    }

    /// Whether [`Self::destroy`] was called
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(TetherError::Destroyed);
        }
        Ok(())
    }

    async fn wait_for_peer(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        predicate: impl Fn(&Peer) -> bool,
    ) -> Result<Arc<Peer>> {
        loop {
            let event = tokio::select! {
                () = self.inner.shutdown.cancelled() => return Err(TetherError::Destroyed),
                event = events.recv() => event,
            };
            match event {
                Ok(SessionEvent::PeerReady(peer) | SessionEvent::TopicAdded { peer, .. }) => {
                    if predicate(&peer) {
                        return Ok(peer);
                    }
                }
                Ok(SessionEvent::Error(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Lookup missed {} session events, rescanning", skipped);
                    if let Some(peer) = self.inner.registry.find(&predicate) {
                        return Ok(peer);
                    }
                }
                Err(RecvError::Closed) => return Err(TetherError::Destroyed),
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("public_key", &hex::encode(&self.public_key()[..8]))
            .field("peers", &self.peer_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl ManagerInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn handle_connection(self: Arc<Self>, connection: IncomingConnection) {
        let IncomingConnection { socket, info } = connection;
        let initiator = info.is_initiator();

        let channel = tokio::select! {
            () = self.shutdown.cancelled() => return,
            result = timeout(
                self.config.handshake_timeout,
                SecureChannel::handshake(socket, initiator, self.identity.keypair()),
            ) => match result {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    tracing::debug!("Handshake failed: {}", TetherError::from(e));
                    return;
                }
                Err(_) => {
                    tracing::debug!("Handshake timed out");
                    return;
                }
            }
        };

        let remote = *channel.remote_static();
        if &remote == self.identity.public_key() {
            tracing::debug!("Dropping connection to self");
            return;
        }
        if info.deduplicate(self.identity.public_key(), &remote) {
            tracing::debug!(
                "Dropping duplicate connection to {} (initiator: {})",
                hex::encode(&remote[..8]),
                initiator
            );
            return;
        }

        let (reader, writer) = channel.split();
        let (mux, mux_events) = Multiplexer::new(reader, writer);

        let topic_updates = info.subscribe_topics();
        let topics: TopicSet = info.observed_topics().into_iter().collect();
        let peer = Peer::new(PeerInit {
            session_id: self.registry.next_session_id(),
            public_key: remote,
            info,
            mux,
            topics,
            session_events: self.events.clone(),
            registry: Arc::downgrade(&self.registry),
            config: Arc::clone(&self.config),
        });
        self.registry.insert(Arc::clone(&peer));

        if self.is_destroyed() {
            let _ = peer.disconnect().await;
            return;
        }

        let local_topics = self.topics.read().to_vec();
        let drop_signal = peer.drop_signal();
        let exchanged = tokio::select! {
            () = self.shutdown.cancelled() => Err(TetherError::Destroyed),
            () = drop_signal.cancelled() => Err(TetherError::transport("connection dropped by discovery")),
            result = timeout(
                self.config.exchange_timeout,
                exchange(peer.mux(), &local_topics, self.config.max_topics),
            ) => result.unwrap_or_else(|_| Err(TetherError::timeout("metadata exchange"))),
        };

        match exchanged {
            Ok(remote_topics) => peer.extend_topics(remote_topics),
            Err(e) => {
                // A duplicate losing the tie-break is closed by either side
                // mid-exchange; only a misbehaving or silent remote is an error
                let reportable = matches!(e, TetherError::Protocol(_) | TetherError::Timeout(_))
                    && !drop_signal.is_cancelled()
                    && !peer.is_closing();
                if reportable {
                    tracing::warn!(
                        "Metadata exchange with {} failed: {}",
                        hex::encode(&remote[..8]),
                        e
                    );
                    let _ = self.events.send(SessionEvent::Error(e));
                } else {
                    tracing::debug!(
                        "Session with {} ended during metadata exchange: {}",
                        hex::encode(&remote[..8]),
                        e
                    );
                }
                let _ = peer.disconnect().await;
                return;
            }
        }

        if !peer.mark_ready() {
            return;
        }
        peer.spawn_driver(mux_events, topic_updates);

        if self.is_destroyed() {
            let _ = peer.disconnect().await;
            return;
        }

        tracing::info!(
            "Peer {} ready ({})",
            hex::encode(&remote[..8]),
            if peer.is_incoming() { "incoming" } else { "outgoing" }
        );
        let _ = self.events.send(SessionEvent::PeerReady(peer));
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Why each announced topic is held
#[derive(Default)]
struct TopicClaims {
    /// Joined through [`SessionManager::join`]
    explicit: HashSet<Topic>,
    /// Running topic lookups per topic
    pending: HashMap<Topic, usize>,
}

impl TopicClaims {
    /// Drop one lookup claim; true when nothing holds the topic anymore
    fn release(&mut self, topic: &Topic) -> bool {
        match self.pending.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.pending.remove(topic);
                !self.explicit.contains(topic)
            }
            None => false,
        }
    }
}

/// Claim on a topic for the lifetime of one topic lookup
struct TopicLookup {
    inner: Arc<ManagerInner>,
    topic: Topic,
}

impl TopicLookup {
    fn begin(inner: Arc<ManagerInner>, topic: Topic) -> Self {
        *inner.lookups.lock().pending.entry(topic).or_default() += 1;
        Self { inner, topic }
    }
}

impl Drop for TopicLookup {
    fn drop(&mut self) {
        let inner = &self.inner;
        let topic = self.topic;
        let released = {
            let mut lookups = inner.lookups.lock();
            lookups.release(&topic) && inner.topics.write().remove(&topic)
        };
        // Destroy tears discovery down as a whole
        if !released || inner.shutdown.is_cancelled() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let discovery = Arc::clone(&inner.discovery);
        inner.tasks.spawn(async move {
            tracing::debug!("Leaving lookup topic {:?}", topic);
            if let Err(e) = discovery.leave(topic).await {
                tracing::warn!("Failed to leave lookup topic {:?}: {}", topic, e);
            }
        });
    }
}

async fn accept_loop(
    inner: Weak<ManagerInner>,
    mut connections: mpsc::UnboundedReceiver<IncomingConnection>,
    shutdown: CancellationToken,
) {
    loop {
        let connection = tokio::select! {
            () = shutdown.cancelled() => break,
            connection = connections.recv() => match connection {
                Some(connection) => connection,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else { break };
        let pipeline = Arc::clone(&inner);
        inner.tasks.spawn(pipeline.handle_connection(connection));
    }
    tracing::debug!("Accept loop stopped");
}
