//! Session multiplexer.
//!
//! One reader task decodes inbound frames and routes them to stream slots;
//! one writer task serializes outbound frames onto the channel. Stream
//! lifecycle changes are reported on an event channel in the order they
//! happen, so a consumer observes open/close notifications for local and
//! remote streams on a single timeline.
//!
//! A stream slot finishes once both sides ended their write direction or
//! either side reset it. `StreamOpened` and `StreamClosed` are emitted at
//! most once per slot and always in that order. Every slot carries a
//! session-unique id, so a name reused after a close is a distinct stream.

use crate::error::MuxError;
use crate::frame::{Frame, FrameType, Namespace};
use crate::stream::{Inbound, MuxStream, Origin, StreamKey};
use crate::transport::{FrameSink, FrameSource};
use crate::MAX_NAME_LEN;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

/// Lifecycle notifications emitted by a [`Multiplexer`]
#[derive(Debug)]
pub enum MuxEvent {
    /// A stream became live (opened locally or by the remote)
    StreamOpened {
        /// Stream identity
        key: StreamKey,
        /// Slot id, unique within the session
        id: u64,
    },
    /// A live stream finished in both directions or was reset
    StreamClosed {
        /// Stream identity
        key: StreamKey,
        /// Slot id, unique within the session
        id: u64,
        /// True when a local end or reset finished the stream, false when a
        /// remote frame did
        locally: bool,
    },
    /// The remote opened a stream nobody has claimed yet
    Incoming(StreamKey),
    /// The session ended; `None` for a clean close
    Terminated(Option<MuxError>),
}

enum WriterCommand {
    Frame(Frame),
    Shutdown(oneshot::Sender<Result<(), MuxError>>),
}

struct Slot {
    id: u64,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    unclaimed: Option<mpsc::UnboundedReceiver<Inbound>>,
    local_opened: bool,
    remote_opened: bool,
    local_ended: bool,
    remote_ended: bool,
    announced: bool,
}

impl Slot {
    fn new(id: u64) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Self {
            id,
            inbound: Some(tx),
            unclaimed: None,
            local_opened: false,
            remote_opened: false,
            local_ended: false,
            remote_ended: false,
            announced: false,
        };
        (slot, rx)
    }
}

/// State shared between the multiplexer handle, its tasks, and its streams
pub(crate) struct MuxShared {
    slots: DashMap<StreamKey, Slot>,
    outbound: mpsc::UnboundedSender<WriterCommand>,
    events: mpsc::UnboundedSender<MuxEvent>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl MuxShared {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: MuxEvent) {
        let _ = self.events.send(event);
    }

    fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        self.outbound
            .send(WriterCommand::Frame(frame))
            .map_err(|_| MuxError::SessionClosed)
    }

    pub(crate) fn send_data(&self, key: &StreamKey, payload: Vec<u8>) -> Result<(), MuxError> {
        self.send_frame(Frame::data(
            key.origin.outbound_namespace(),
            key.name.clone(),
            payload,
        ))
    }

    /// End the local write side of slot `id`; a no-op once that slot is gone
    pub(crate) fn end_local(&self, key: &StreamKey, id: u64) {
        let finished = match self.slots.get_mut(key) {
            Some(mut slot) if slot.id == id => {
                slot.local_ended = true;
                slot.remote_ended
            }
            _ => return,
        };

        let _ = self.send_frame(Frame::control(
            FrameType::End,
            key.origin.outbound_namespace(),
            key.name.clone(),
        ));
        if finished {
            self.finish(key, true);
        }
    }

    pub(crate) fn reset_local(&self, key: &StreamKey, id: u64) {
        if !self.slots.get(key).is_some_and(|slot| slot.id == id) {
            return;
        }
        let _ = self.send_frame(Frame::control(
            FrameType::Reset,
            key.origin.outbound_namespace(),
            key.name.clone(),
        ));
        self.finish(key, true);
    }

    fn finish(&self, key: &StreamKey, locally: bool) {
        if let Some((key, slot)) = self.slots.remove(key) {
            if slot.announced {
                self.emit(MuxEvent::StreamClosed {
                    key,
                    id: slot.id,
                    locally,
                });
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let key = StreamKey::new(Origin::from_inbound(frame.namespace), frame.name);
        match frame.frame_type {
            FrameType::Open => self.on_remote_open(key),
            FrameType::Data => self.on_remote_data(&key, frame.payload),
            FrameType::End => self.on_remote_end(&key),
            FrameType::Reset => self.on_remote_reset(&key),
        }
    }

    fn on_remote_open(&self, key: StreamKey) {
        if key.origin == Origin::Local {
            tracing::trace!("Ignoring remote open for locally owned stream {:?}", key.name);
            return;
        }

        let mut opened = None;
        let mut incoming = false;
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.remote_opened {
                    tracing::trace!("Duplicate open for stream {:?}", key.name);
                } else {
                    slot.remote_opened = true;
                    if !slot.announced {
                        slot.announced = true;
                        opened = Some(slot.id);
                    }
                }
            }
            Entry::Vacant(entry) => {
                let id = self.allocate_id();
                let (mut slot, rx) = Slot::new(id);
                slot.remote_opened = true;
                slot.announced = true;
                slot.unclaimed = Some(rx);
                entry.insert(slot);
                opened = Some(id);
                incoming = key.origin == Origin::Remote;
            }
        }

        if let Some(id) = opened {
            self.emit(MuxEvent::StreamOpened {
                key: key.clone(),
                id,
            });
        }
        if incoming {
            self.emit(MuxEvent::Incoming(key));
        }
    }

    fn on_remote_data(&self, key: &StreamKey, payload: Vec<u8>) {
        match self.slots.get(key) {
            Some(slot) => {
                if let Some(tx) = &slot.inbound {
                    let _ = tx.send(Inbound::Data(payload));
                }
            }
            None => tracing::trace!("Dropping data for unknown stream {:?}", key.name),
        }
    }

    fn on_remote_end(&self, key: &StreamKey) {
        let finished = match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.remote_ended = true;
                slot.inbound = None;
                slot.local_ended
            }
            None => false,
        };
        if finished {
            self.finish(key, false);
        }
    }

    fn on_remote_reset(&self, key: &StreamKey) {
        if let Some(slot) = self.slots.get(key) {
            if let Some(tx) = &slot.inbound {
                let _ = tx.send(Inbound::Reset);
            }
        }
        self.finish(key, false);
    }

    fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.retain(|_, slot| {
            if let Some(tx) = slot.inbound.take() {
                let _ = tx.send(Inbound::Aborted);
            }
            false
        });
    }
}

/// Multiplexed session over a message transport.
///
/// # Example
///
/// ```no_run
/// use tether_mux::{FrameSink, FrameSource, Multiplexer};
///
/// async fn demo(source: impl FrameSource, sink: impl FrameSink) {
///     let (mux, _events) = Multiplexer::new(source, sink);
///     let stream = mux.open("example").unwrap();
///     stream.write(b"Hello World").unwrap();
/// }
/// ```
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    reader: AbortHandle,
    writer: AbortHandle,
    terminated: watch::Receiver<bool>,
}

impl Multiplexer {
    /// Start a multiplexer; must be called from within a Tokio runtime.
    pub fn new<R, W>(source: R, sink: W) -> (Self, mpsc::UnboundedReceiver<MuxEvent>)
    where
        R: FrameSource,
        W: FrameSink,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let shared = Arc::new(MuxShared {
            slots: DashMap::new(),
            outbound: outbound_tx,
            events: events_tx.clone(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });

        let writer = tokio::spawn(run_writer(sink, outbound_rx, events_tx));
        let reader = tokio::spawn(run_reader(source, Arc::clone(&shared), terminated_tx));

        let mux = Self {
            shared,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
            terminated: terminated_rx,
        };
        (mux, events_rx)
    }

    /// Open a locally owned stream.
    ///
    /// # Errors
    ///
    /// Fails if a local stream with this name is live or the session closed.
    pub fn open(&self, name: &str) -> Result<MuxStream, MuxError> {
        self.check_open(name)?;
        let key = StreamKey::new(Origin::Local, name);
        let id = self.shared.allocate_id();

        let rx = match self.shared.slots.entry(key.clone()) {
            Entry::Occupied(_) => return Err(MuxError::StreamExists(name.to_string())),
            Entry::Vacant(entry) => {
                let (mut slot, rx) = Slot::new(id);
                slot.local_opened = true;
                slot.announced = true;
                entry.insert(slot);
                rx
            }
        };

        // Announce before the Open frame can provoke a remote reset
        self.shared.emit(MuxEvent::StreamOpened {
            key: key.clone(),
            id,
        });
        if let Err(e) = self
            .shared
            .send_frame(Frame::control(FrameType::Open, Namespace::Sender, name))
        {
            self.shared.finish(&key, true);
            return Err(e);
        }

        Ok(MuxStream::new(key, id, rx, Arc::clone(&self.shared)))
    }

    /// Claim the stream the remote opens (or already opened) under `name`.
    ///
    /// # Errors
    ///
    /// Fails if the stream was already claimed or the session closed.
    pub fn receive(&self, name: &str) -> Result<MuxStream, MuxError> {
        self.check_open(name)?;
        let key = StreamKey::new(Origin::Remote, name);

        let (id, rx) = match self.shared.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                let rx = slot
                    .unclaimed
                    .take()
                    .ok_or_else(|| MuxError::StreamExists(name.to_string()))?;
                (slot.id, rx)
            }
            Entry::Vacant(entry) => {
                let id = self.shared.allocate_id();
                let (slot, rx) = Slot::new(id);
                entry.insert(slot);
                (id, rx)
            }
        };

        Ok(MuxStream::new(key, id, rx, Arc::clone(&self.shared)))
    }

    /// Open or join the shared stream `name`.
    ///
    /// # Errors
    ///
    /// Fails if the shared stream was already claimed locally or the session
    /// closed.
    pub fn shared(&self, name: &str) -> Result<MuxStream, MuxError> {
        self.check_open(name)?;
        let key = StreamKey::new(Origin::Shared, name);

        let (id, rx, opened) = match self.shared.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                let rx = slot
                    .unclaimed
                    .take()
                    .ok_or_else(|| MuxError::StreamExists(name.to_string()))?;
                slot.local_opened = true;
                (slot.id, rx, false)
            }
            Entry::Vacant(entry) => {
                let id = self.shared.allocate_id();
                let (mut slot, rx) = Slot::new(id);
                slot.local_opened = true;
                slot.announced = true;
                entry.insert(slot);
                (id, rx, true)
            }
        };

        if opened {
            self.shared.emit(MuxEvent::StreamOpened {
                key: key.clone(),
                id,
            });
        }
        if let Err(e) = self
            .shared
            .send_frame(Frame::control(FrameType::Open, Namespace::Shared, name))
        {
            self.shared.finish(&key, true);
            return Err(e);
        }
        Ok(MuxStream::new(key, id, rx, Arc::clone(&self.shared)))
    }

    /// Whether the session stopped accepting new streams
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Gracefully close: flush queued frames, end the outbound direction,
    /// then wait for the remote to close its side.
    ///
    /// # Errors
    ///
    /// Returns the error from shutting down the outbound direction.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.shared.closed.store(true, Ordering::Release);

        let (reply_tx, reply_rx) = oneshot::channel();
        let shutdown = if self
            .shared
            .outbound
            .send(WriterCommand::Shutdown(reply_tx))
            .is_ok()
        {
            reply_rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };

        let mut terminated = self.terminated.clone();
        let _ = terminated.wait_for(|done| *done).await;
        shutdown
    }

    /// Stop both tasks immediately without a graceful close
    pub fn abort(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
    }

    fn check_open(&self, name: &str) -> Result<(), MuxError> {
        if name.len() > MAX_NAME_LEN {
            return Err(crate::FrameError::NameTooLong(name.len()).into());
        }
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        Ok(())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn run_writer<W: FrameSink>(
    mut sink: W,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    events: mpsc::UnboundedSender<MuxEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Skipping unencodable frame for {:?}: {}", frame.name, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(&bytes).await {
                    tracing::debug!("Multiplexer writer failed: {}", e);
                    let _ = events.send(MuxEvent::Terminated(Some(e.into())));
                    return;
                }
            }
            WriterCommand::Shutdown(reply) => {
                let result = sink.close().await.map_err(MuxError::from);
                let _ = reply.send(result);
                return;
            }
        }
    }
}

async fn run_reader<R: FrameSource>(
    mut source: R,
    shared: Arc<MuxShared>,
    terminated: watch::Sender<bool>,
) {
    let outcome = loop {
        match source.recv().await {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => break Some(MuxError::from(e)),
            },
            Ok(None) => break None,
            Err(e) => break Some(MuxError::from(e)),
        }
    };

    if let Some(e) = &outcome {
        tracing::debug!("Multiplexer reader stopped: {}", e);
    }

    shared.terminate();
    shared.emit(MuxEvent::Terminated(outcome));
    let _ = terminated.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_crypto::{KeyPair, SecureChannel};
    use tokio::time::{Duration, timeout};

    async fn mux_pair() -> (
        (Multiplexer, mpsc::UnboundedReceiver<MuxEvent>),
        (Multiplexer, mpsc::UnboundedReceiver<MuxEvent>),
    ) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (init, resp) = tokio::join!(
            SecureChannel::handshake(left, true, &a),
            SecureChannel::handshake(right, false, &b),
        );
        let (ar, aw) = init.unwrap().split();
        let (br, bw) = resp.unwrap().split();
        (Multiplexer::new(ar, aw), Multiplexer::new(br, bw))
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<MuxEvent>) -> MuxEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_open_and_receive_roundtrip() {
        let ((a, _a_events), (b, _b_events)) = mux_pair().await;

        let mut inbound = b.receive("example").unwrap();
        let outbound = a.open("example").unwrap();
        outbound.write(b"Hello World").unwrap();

        let data = inbound.read().await.unwrap().unwrap();
        assert_eq!(data, b"Hello World");
    }

    #[tokio::test]
    async fn test_receive_after_remote_open() {
        let ((a, _a_events), (b, mut b_events)) = mux_pair().await;

        let mut outbound = a.open("late").unwrap();
        outbound.write(b"early bytes").unwrap();
        outbound.end();

        assert!(matches!(next_event(&mut b_events).await, MuxEvent::StreamOpened { .. }));
        assert!(matches!(next_event(&mut b_events).await, MuxEvent::Incoming(_)));

        let mut inbound = b.receive("late").unwrap();
        let data = inbound.read_to_end(1024).await.unwrap();
        assert_eq!(data, b"early bytes");
    }

    #[tokio::test]
    async fn test_same_name_both_directions_do_not_collide() {
        let ((a, _a_events), (b, _b_events)) = mux_pair().await;

        let a_out = a.open("chat").unwrap();
        let b_out = b.open("chat").unwrap();
        let mut a_in = a.receive("chat").unwrap();
        let mut b_in = b.receive("chat").unwrap();

        a_out.write(b"from a").unwrap();
        b_out.write(b"from b").unwrap();

        assert_eq!(b_in.read().await.unwrap().unwrap(), b"from a");
        assert_eq!(a_in.read().await.unwrap().unwrap(), b"from b");
    }

    #[tokio::test]
    async fn test_shared_stream_exchange() {
        let ((a, _a_events), (b, _b_events)) = mux_pair().await;

        let mut a_shared = a.shared("ctl").unwrap();
        let mut b_shared = b.shared("ctl").unwrap();

        a_shared.write(b"ping").unwrap();
        a_shared.end();
        b_shared.write(b"pong").unwrap();
        b_shared.end();

        assert_eq!(b_shared.read_to_end(64).await.unwrap(), b"ping");
        assert_eq!(a_shared.read_to_end(64).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let ((a, _a_events), _b) = mux_pair().await;

        let _first = a.open("dup").unwrap();
        assert!(matches!(a.open("dup"), Err(MuxError::StreamExists(_))));
    }

    #[tokio::test]
    async fn test_write_after_end_rejected() {
        let ((a, _a_events), _b) = mux_pair().await;

        let mut stream = a.open("once").unwrap();
        stream.end();
        assert!(matches!(stream.write(b"late"), Err(MuxError::StreamEnded)));
    }

    #[tokio::test]
    async fn test_close_events_after_both_ends() {
        let ((a, mut a_events), (b, _b_events)) = mux_pair().await;

        let mut inbound = b.receive("s").unwrap();
        let mut outbound = a.open("s").unwrap();
        assert!(matches!(next_event(&mut a_events).await, MuxEvent::StreamOpened { .. }));

        outbound.end();
        assert!(inbound.read().await.unwrap().is_none());
        drop(inbound);

        match next_event(&mut a_events).await {
            MuxEvent::StreamClosed { key, id, locally } => {
                assert_eq!(key.origin, Origin::Local);
                assert_eq!(key.name, "s");
                assert_eq!(id, outbound.id());
                // The remote's End finished it
                assert!(!locally);
            }
            other => panic!("expected StreamClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_end_finishes_locally() {
        let ((a, _a_events), (b, mut b_events)) = mux_pair().await;

        let mut outbound = a.open("s").unwrap();
        outbound.end();

        let mut inbound = b.receive("s").unwrap();
        assert!(inbound.read().await.unwrap().is_none());
        inbound.end();

        loop {
            match next_event(&mut b_events).await {
                MuxEvent::StreamClosed { locally, .. } => {
                    assert!(locally);
                    break;
                }
                MuxEvent::StreamOpened { .. } | MuxEvent::Incoming(_) => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_open_announced_before_remote_reset() {
        let ((a, mut a_events), (b, mut b_events)) = mux_pair().await;

        let outbound = a.open("r").unwrap();
        let _ = next_event(&mut b_events).await;
        b.receive("r").unwrap().reset();

        match next_event(&mut a_events).await {
            MuxEvent::StreamOpened { id, .. } => assert_eq!(id, outbound.id()),
            other => panic!("expected StreamOpened first, got {other:?}"),
        }
        match next_event(&mut a_events).await {
            MuxEvent::StreamClosed { id, locally, .. } => {
                assert_eq!(id, outbound.id());
                assert!(!locally);
            }
            other => panic!("expected StreamClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_end_reused_name() {
        let ((a, mut a_events), (b, mut b_events)) = mux_pair().await;

        let stale = a.open("r").unwrap();
        let _ = next_event(&mut b_events).await;
        b.receive("r").unwrap().reset();
        loop {
            if let MuxEvent::StreamClosed { id, .. } = next_event(&mut a_events).await {
                assert_eq!(id, stale.id());
                break;
            }
        }

        let fresh = a.open("r").unwrap();
        assert_ne!(fresh.id(), stale.id());
        drop(stale);

        let mut second_in = b.receive("r").unwrap();
        fresh.write(b"still open").unwrap();
        assert_eq!(second_in.read().await.unwrap().unwrap(), b"still open");
    }

    #[tokio::test]
    async fn test_reset_reaches_remote() {
        let ((a, _a_events), (b, _b_events)) = mux_pair().await;

        let mut inbound = b.receive("r").unwrap();
        let outbound = a.open("r").unwrap();
        outbound.reset();

        assert!(matches!(inbound.read().await, Err(MuxError::StreamReset)));
    }

    #[tokio::test]
    async fn test_close_terminates_both_sides() {
        let ((a, mut a_events), (b, mut b_events)) = mux_pair().await;

        let mut pending = b.receive("never").unwrap();

        let closer = tokio::spawn(async move {
            a.close().await.unwrap();
            a
        });

        match next_event(&mut b_events).await {
            MuxEvent::Terminated(None) => {}
            other => panic!("expected clean termination, got {other:?}"),
        }
        assert!(matches!(pending.read().await, Err(MuxError::SessionClosed)));

        b.close().await.unwrap();
        let a = closer.await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(next_event(&mut a_events).await, MuxEvent::Terminated(None)));
        assert!(matches!(a.open("x"), Err(MuxError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let ((a, _a_events), (b, _b_events)) = mux_pair().await;

        let mut inbound = b.receive("bulk").unwrap();
        let mut outbound = a.open("bulk").unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        outbound.write(&payload).unwrap();
        outbound.end();

        let received = inbound.read_to_end(200_000).await.unwrap();
        assert_eq!(received, payload);
    }
}
