//! Authenticated peer sessions.
//!
//! A [`Peer`] owns one multiplexed session with a remote whose static key was
//! proven by the Noise handshake. Peers move through a fixed lifecycle:
//!
//! ```text
//! ExchangingMetadata ──► Ready ──► Closing ──► Closed
//!          │                          ▲
//!          └──────────────────────────┘
//! ```
//!
//! Once ready, a lifecycle driver task watches the session: it counts
//! application streams, appends topics discovery observes later, and
//! disconnects the peer when the last stream closes, when discovery drops the
//! connection, or when the remote goes away.
//!
//! Streams opened through the peer API are counted synchronously, under the
//! same lock the idle decision takes, so an application that closes its last
//! stream and immediately opens another never races the driver. The side
//! whose own end or reset finished the last stream makes the idle decision;
//! the other side waits for the resulting session close and only falls back
//! to its own decision after the close timeout.

use crate::config::TetherConfig;
use crate::discovery::ConnectionInfo;
use crate::error::{Result, TetherError};
use crate::events::{PeerEvent, SessionEvent};
use crate::identity::PeerId;
use crate::metadata::is_reserved;
use crate::registry::Registry;
use crate::topic::{Topic, TopicSet};
use crate::tracker::{StreamTracker, spawn_idle_check};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_mux::{MuxError, MuxEvent, MuxStream, Multiplexer, StreamKey};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Peer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Noise handshake in progress.
    ///
    /// Describes the connection before a peer exists; a [`Peer`] is only
    /// built once the handshake succeeded, so `Peer::state` never reports it.
    Handshaking,
    /// Waiting for the remote's topic announcement
    ExchangingMetadata,
    /// Accepting streams
    Ready,
    /// Teardown in progress
    Closing,
    /// Session closed
    Closed,
}

/// Everything the pipeline hands over when it builds a peer
pub(crate) struct PeerInit {
    pub session_id: u64,
    pub public_key: PeerId,
    pub info: Arc<dyn ConnectionInfo>,
    pub mux: Multiplexer,
    pub topics: TopicSet,
    pub session_events: broadcast::Sender<SessionEvent>,
    pub registry: Weak<Registry>,
    pub config: Arc<TetherConfig>,
}

/// A remote node with an authenticated, multiplexed session
pub struct Peer {
    session_id: u64,
    public_key: PeerId,
    incoming: bool,
    info: Arc<dyn ConnectionInfo>,
    mux: Multiplexer,
    state: RwLock<PeerState>,
    topics: RwLock<TopicSet>,
    tracker: SyncMutex<StreamTracker>,
    events: broadcast::Sender<PeerEvent>,
    session_events: broadcast::Sender<SessionEvent>,
    incoming_streams: Mutex<mpsc::UnboundedReceiver<StreamKey>>,
    incoming_tx: mpsc::UnboundedSender<StreamKey>,
    closing: AtomicBool,
    close_result: watch::Sender<Option<Result<()>>>,
    shutdown: CancellationToken,
    registry: Weak<Registry>,
    config: Arc<TetherConfig>,
}

impl Peer {
    pub(crate) fn new(init: PeerInit) -> Arc<Self> {
        let (events, _) = broadcast::channel(init.config.event_capacity);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (close_result, _) = watch::channel(None);

        Arc::new(Self {
            session_id: init.session_id,
            public_key: init.public_key,
            incoming: !init.info.is_initiator(),
            info: init.info,
            mux: init.mux,
            state: RwLock::new(PeerState::ExchangingMetadata),
            topics: RwLock::new(init.topics),
            tracker: SyncMutex::new(StreamTracker::new()),
            events,
            session_events: init.session_events,
            incoming_streams: Mutex::new(incoming_rx),
            incoming_tx,
            closing: AtomicBool::new(false),
            close_result,
            shutdown: CancellationToken::new(),
            registry: init.registry,
            config: init.config,
        })
    }

    /// Per-connection session id
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Remote's authenticated static public key
    pub fn public_key(&self) -> &PeerId {
        &self.public_key
    }

    /// True when the remote initiated the connection
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// Whether the peer accepts streams
    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    /// Topics the peer is known to be in, in the order they were learned
    pub fn topics(&self) -> Vec<Topic> {
        self.topics.read().to_vec()
    }

    /// Whether the peer is known to be in `topic`
    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.topics.read().contains(topic)
    }

    /// Number of open application streams
    pub fn stream_count(&self) -> usize {
        self.tracker.lock().count()
    }

    /// Subscribe to this peer's events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Open a stream owned by this side
    ///
    /// # Errors
    ///
    /// [`TetherError::InvalidState`] unless the peer is ready,
    /// [`TetherError::Stream`] for reserved or already open names.
    pub fn create_stream(&self, name: &str) -> Result<MuxStream> {
        self.open_counted(name, |mux| mux.open(name))
    }

    /// Bind to the stream the remote opens (or opened) under `name`
    ///
    /// # Errors
    ///
    /// [`TetherError::InvalidState`] unless the peer is ready,
    /// [`TetherError::Stream`] for reserved or already claimed names.
    pub fn receive_stream(&self, name: &str) -> Result<MuxStream> {
        self.check_stream(name)?;
        Ok(self.mux.receive(name)?)
    }

    /// Open or join the shared stream `name`; both sides get the same stream
    /// no matter who initiated the connection
    ///
    /// # Errors
    ///
    /// [`TetherError::InvalidState`] unless the peer is ready,
    /// [`TetherError::Stream`] for reserved or already claimed names.
    pub fn create_shared_stream(&self, name: &str) -> Result<MuxStream> {
        self.open_counted(name, |mux| mux.shared(name))
    }

    /// Next stream the remote opened that nobody claimed with
    /// [`Self::receive_stream`]; `None` once the peer disconnects
    pub async fn accept_stream(&self) -> Option<(String, MuxStream)> {
        let mut incoming = self.incoming_streams.lock().await;
        loop {
            let key = tokio::select! {
                key = incoming.recv() => key?,
                () = self.shutdown.cancelled() => return None,
            };
            match self.mux.receive(&key.name) {
                Ok(stream) => return Some((key.name, stream)),
                Err(e) => tracing::trace!("Stream {:?} already claimed: {}", key.name, e),
            }
        }
    }

    /// Never reconnect to this remote through discovery
    pub fn ban(&self) {
        self.info.ban();
    }

    /// Ask discovery to wait before reconnecting to this remote
    pub fn backoff(&self) {
        self.info.backoff();
    }

    /// Close the session.
    ///
    /// Idempotent: exactly one teardown runs, and every caller, concurrent or
    /// later, observes its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Timeout`] if the session did not close
    /// gracefully within the configured close timeout, and
    /// [`TetherError::Transport`] if closing the transport failed.
    pub async fn disconnect(&self) -> Result<()> {
        let mut outcome = self.close_result.subscribe();

        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let result = self.teardown().await;
            self.close_result.send_replace(Some(result.clone()));
            return result;
        }

        match outcome.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone().unwrap_or(Ok(())),
            Err(_) => Ok(()),
        }
    }

    async fn teardown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), PeerState::Closing);
        tracing::debug!(
            "Disconnecting peer {} (was {:?})",
            hex::encode(&self.public_key[..8]),
            previous
        );
        self.shutdown.cancel();

        let result = match tokio::time::timeout(self.config.close_timeout, self.mux.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!("Session close failed: {}", e);
                Err(TetherError::Transport(Cow::Owned(format!(
                    "session close failed: {e}"
                ))))
            }
            Err(_) => {
                tracing::warn!(
                    "Session with {} did not close in time, aborting",
                    hex::encode(&self.public_key[..8])
                );
                self.mux.abort();
                Err(TetherError::timeout("session close"))
            }
        };

        *self.state.write() = PeerState::Closed;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.session_id);
        }
        let _ = self.events.send(PeerEvent::Disconnected);

        tracing::info!("Peer {} disconnected", hex::encode(&self.public_key[..8]));
        result
    }

    /// Open through `open` and count the stream before the idle check can
    /// observe the session without it
    fn open_counted(
        &self,
        name: &str,
        open: impl FnOnce(&Multiplexer) -> std::result::Result<MuxStream, MuxError>,
    ) -> Result<MuxStream> {
        let mut tracker = self.tracker.lock();
        self.check_stream(name)?;
        let stream = open(&self.mux)?;
        tracker.on_opened(stream.id());
        Ok(stream)
    }

    /// Settle the idle check for `generation`; on true the peer is already
    /// `Closing` and no stream can be opened anymore
    fn begin_idle_close(&self, generation: u64) -> bool {
        let mut tracker = self.tracker.lock();
        if !tracker.on_deferred(generation) {
            return false;
        }
        let mut state = self.state.write();
        if *state == PeerState::Ready {
            *state = PeerState::Closing;
        }
        true
    }

    fn check_stream(&self, name: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(TetherError::invalid_state("peer is not ready"));
        }
        if is_reserved(name) {
            return Err(TetherError::stream("stream name is reserved"));
        }
        Ok(())
    }

    pub(crate) fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub(crate) fn drop_signal(&self) -> CancellationToken {
        self.info.drop_signal()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Merge topics learned before the peer became ready
    pub(crate) fn extend_topics(&self, topics: impl IntoIterator<Item = Topic>) {
        let mut set = self.topics.write();
        for topic in topics {
            set.insert(topic);
        }
    }

    /// `ExchangingMetadata → Ready`; false if teardown already started
    pub(crate) fn mark_ready(&self) -> bool {
        let mut state = self.state.write();
        if *state == PeerState::ExchangingMetadata {
            *state = PeerState::Ready;
            true
        } else {
            false
        }
    }

    /// Start the lifecycle driver for a ready peer
    pub(crate) fn spawn_driver(
        self: &Arc<Self>,
        mux_events: mpsc::UnboundedReceiver<MuxEvent>,
        topic_updates: broadcast::Receiver<Topic>,
    ) {
        tokio::spawn(Arc::clone(self).drive(mux_events, topic_updates));
    }

    async fn drive(
        self: Arc<Self>,
        mut mux_events: mpsc::UnboundedReceiver<MuxEvent>,
        topic_updates: broadcast::Receiver<Topic>,
    ) {
        // Let subscribers attached on the ready event see the initial topics
        tokio::task::yield_now().await;
        for topic in self.topics() {
            let _ = self.events.send(PeerEvent::TopicAdded(topic));
        }

        let drop_signal = self.info.drop_signal();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let mut topic_updates = Some(topic_updates);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                () = drop_signal.cancelled() => {
                    tracing::debug!(
                        "Discovery dropped connection to {}",
                        hex::encode(&self.public_key[..8])
                    );
                    let _ = self.disconnect().await;
                    break;
                }

                event = mux_events.recv() => {
                    let Some(event) = event else { break };
                    if !self.on_mux_event(event, &idle_tx) {
                        let _ = self.disconnect().await;
                        break;
                    }
                }

                Some(generation) = idle_rx.recv() => {
                    // Opens the reader already dispatched count before deciding
                    let mut alive = true;
                    while let Ok(event) = mux_events.try_recv() {
                        if !self.on_mux_event(event, &idle_tx) {
                            alive = false;
                            break;
                        }
                    }
                    if !alive {
                        let _ = self.disconnect().await;
                        break;
                    }
                    if self.begin_idle_close(generation) {
                        tracing::debug!(
                            "No open streams left with {}, disconnecting",
                            hex::encode(&self.public_key[..8])
                        );
                        let _ = self.disconnect().await;
                        break;
                    }
                }

                update = next_topic(&mut topic_updates) => match update {
                    Some(topic) => self.on_topic(topic),
                    None => {
                        for topic in self.info.observed_topics() {
                            self.on_topic(topic);
                        }
                    }
                },
            }
        }

        tracing::trace!("Driver for session {} stopped", self.session_id);
    }

    /// Returns false when the session is gone
    fn on_mux_event(
        self: &Arc<Self>,
        event: MuxEvent,
        idle_tx: &mpsc::UnboundedSender<u64>,
    ) -> bool {
        match event {
            MuxEvent::StreamOpened { key, id } => {
                if !is_reserved(&key.name) {
                    self.tracker.lock().on_opened(id);
                    let _ = self.events.send(PeerEvent::StreamOpened { name: key.name });
                }
            }
            MuxEvent::StreamClosed { key, id, locally } => {
                if !is_reserved(&key.name) {
                    let mut tracker = self.tracker.lock();
                    if let Some(generation) = tracker.on_closed(id) {
                        let grace = if locally {
                            self.config.idle_grace
                        } else {
                            // The remote decides; this is the fallback
                            self.config.idle_grace.max(self.config.close_timeout)
                        };
                        tracker.arm(spawn_idle_check(generation, grace, idle_tx.clone()));
                    }
                }
            }
            MuxEvent::Incoming(key) => {
                if !is_reserved(&key.name) {
                    let _ = self.incoming_tx.send(key);
                }
            }
            MuxEvent::Terminated(error) => {
                if let Some(error) = error {
                    if !self.is_closing() {
                        tracing::warn!(
                            "Session with {} failed: {}",
                            hex::encode(&self.public_key[..8]),
                            error
                        );
                        let _ = self.events.send(PeerEvent::Error(error.into()));
                    }
                }
                return false;
            }
        }
        true
    }

    fn on_topic(self: &Arc<Self>, topic: Topic) {
        if !self.topics.write().insert(topic) {
            return;
        }
        let _ = self.events.send(PeerEvent::TopicAdded(topic));
        let _ = self.session_events.send(SessionEvent::TopicAdded {
            peer: Arc::clone(self),
            topic,
        });
    }
}

/// Next topic from discovery; `None` after a lag so the caller can resync.
/// Pends forever once discovery stops publishing.
async fn next_topic(updates: &mut Option<broadcast::Receiver<Topic>>) -> Option<Topic> {
    loop {
        let Some(rx) = updates.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(topic) => return Some(topic),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} topic updates, resyncing", skipped);
                return None;
            }
            Err(RecvError::Closed) => *updates = None,
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("session_id", &self.session_id)
            .field("public_key", &hex::encode(&self.public_key[..8]))
            .field("incoming", &self.incoming)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tether_crypto::CryptoError;
    use tether_mux::{FrameSink, FrameSource};

    type IoResult<T> = std::result::Result<T, CryptoError>;

    /// Remote that never sends anything
    struct SilentSource;

    #[async_trait]
    impl FrameSource for SilentSource {
        async fn recv(&mut self) -> IoResult<Option<Vec<u8>>> {
            std::future::pending().await
        }
    }

    /// Remote that already hung up
    struct ClosedSource;

    #[async_trait]
    impl FrameSource for ClosedSource {
        async fn recv(&mut self) -> IoResult<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    struct TestSink {
        fail_close: bool,
    }

    #[async_trait]
    impl FrameSink for TestSink {
        async fn send(&mut self, _message: &[u8]) -> IoResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> IoResult<()> {
            if self.fail_close {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone").into())
            } else {
                Ok(())
            }
        }
    }

    struct TestInfo {
        topics: broadcast::Sender<Topic>,
        drop_signal: CancellationToken,
    }

    impl ConnectionInfo for TestInfo {
        fn is_initiator(&self) -> bool {
            true
        }

        fn deduplicate(&self, _local: &PeerId, _remote: &PeerId) -> bool {
            false
        }

        fn observed_topics(&self) -> Vec<Topic> {
            Vec::new()
        }

        fn subscribe_topics(&self) -> broadcast::Receiver<Topic> {
            self.topics.subscribe()
        }

        fn drop_signal(&self) -> CancellationToken {
            self.drop_signal.clone()
        }

        fn ban(&self) {}

        fn backoff(&self) {}
    }

    fn test_peer(
        mux: Multiplexer,
        registry: &Arc<Registry>,
        config: TetherConfig,
    ) -> (Arc<Peer>, broadcast::Receiver<Topic>) {
        let info = Arc::new(TestInfo {
            topics: broadcast::channel(4).0,
            drop_signal: CancellationToken::new(),
        });
        let topic_updates = info.subscribe_topics();
        let (session_events, _) = broadcast::channel(16);
        let peer = Peer::new(PeerInit {
            session_id: registry.next_session_id(),
            public_key: [7; 32],
            info,
            mux,
            topics: TopicSet::new(),
            session_events,
            registry: Arc::downgrade(registry),
            config: Arc::new(config),
        });
        registry.insert(Arc::clone(&peer));
        (peer, topic_updates)
    }

    fn count_disconnects(events: &mut broadcast::Receiver<PeerEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::Disconnected) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_disconnect_reports_transport_close_failure() {
        let registry = Arc::new(Registry::new());
        let (mux, _mux_events) = Multiplexer::new(ClosedSource, TestSink { fail_close: true });
        let (peer, _) = test_peer(mux, &registry, TetherConfig::default());
        assert!(peer.mark_ready());
        let mut events = peer.subscribe();

        let first = peer.disconnect().await;
        assert!(matches!(first, Err(TetherError::Transport(_))));

        // Later callers observe the same outcome without a second teardown
        let second = peer.disconnect().await;
        assert!(matches!(second, Err(TetherError::Transport(_))));

        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(registry.len(), 0);
        assert_eq!(count_disconnects(&mut events), 1);
    }

    #[tokio::test]
    async fn test_clean_close_resolves_ok() {
        let registry = Arc::new(Registry::new());
        let (mux, _mux_events) = Multiplexer::new(ClosedSource, TestSink { fail_close: false });
        let (peer, _) = test_peer(mux, &registry, TetherConfig::default());

        peer.disconnect().await.unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_new_peer_starts_after_handshake() {
        let registry = Arc::new(Registry::new());
        let (mux, _mux_events) = Multiplexer::new(SilentSource, TestSink { fail_close: false });
        let (peer, _) = test_peer(mux, &registry, TetherConfig::default());

        assert_eq!(peer.state(), PeerState::ExchangingMetadata);
        assert!(!peer.is_ready());
        assert!(matches!(
            peer.create_stream("early"),
            Err(TetherError::InvalidState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_right_after_last_close_keeps_peer() {
        let config = TetherConfig {
            close_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let registry = Arc::new(Registry::new());
        let (mux, mux_events) = Multiplexer::new(SilentSource, TestSink { fail_close: false });
        let (peer, topic_updates) = test_peer(mux, &registry, config);
        assert!(peer.mark_ready());
        let mut events = peer.subscribe();
        peer.spawn_driver(mux_events, topic_updates);

        for round in 0..50 {
            let stream = peer.create_stream(&format!("round-{round}")).unwrap();
            // The previous round's close may still be queued for the driver
            assert!(peer.stream_count() >= 1);
            tokio::task::yield_now().await;
            stream.reset();
        }
        let last = peer.create_stream("last").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.state(), PeerState::Ready);
        assert_eq!(peer.stream_count(), 1);
        assert_eq!(count_disconnects(&mut events), 0);

        // Closing the last stream for good still disconnects
        last.reset();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PeerEvent::Disconnected) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_streams_refused_once_idle_close_decided() {
        let registry = Arc::new(Registry::new());
        let (mux, _mux_events) = Multiplexer::new(SilentSource, TestSink { fail_close: false });
        let (peer, _) = test_peer(mux, &registry, TetherConfig::default());
        assert!(peer.mark_ready());

        let stream = peer.create_stream("only").unwrap();
        let id = stream.id();
        let generation = peer.tracker.lock().on_closed(id).unwrap();
        assert!(peer.begin_idle_close(generation));

        assert_eq!(peer.state(), PeerState::Closing);
        assert!(matches!(
            peer.create_stream("late"),
            Err(TetherError::InvalidState(_))
        ));
    }
}
