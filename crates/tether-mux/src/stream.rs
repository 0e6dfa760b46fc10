//! Named streams within a multiplexed session.
//!
//! Streams are logical bidirectional byte channels. A stream is identified
//! by its name together with its [`Origin`], so both sides may open a
//! stream called `"example"` without colliding, while a shared stream is the
//! same channel regardless of who opened it first.

use crate::error::MuxError;
use crate::frame::Namespace;
use crate::mux::MuxShared;
use crate::MAX_PAYLOAD_SIZE;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side owns a stream name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Opened locally with `open`
    Local,
    /// Opened by the remote
    Remote,
    /// Negotiated by both sides with `shared`
    Shared,
}

impl Origin {
    /// Namespace written on outbound frames for a stream of this origin
    pub(crate) fn outbound_namespace(self) -> Namespace {
        match self {
            Origin::Local => Namespace::Sender,
            Origin::Remote => Namespace::Receiver,
            Origin::Shared => Namespace::Shared,
        }
    }

    /// Origin of the local stream an inbound frame refers to
    pub(crate) fn from_inbound(namespace: Namespace) -> Self {
        match namespace {
            Namespace::Sender => Origin::Remote,
            Namespace::Receiver => Origin::Local,
            Namespace::Shared => Origin::Shared,
        }
    }
}

/// Identity of a stream inside one session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Owning side
    pub origin: Origin,
    /// Application-chosen name
    pub name: String,
}

impl StreamKey {
    /// Create a stream key
    pub fn new(origin: Origin, name: impl Into<String>) -> Self {
        Self {
            origin,
            name: name.into(),
        }
    }
}

/// Item delivered to a stream's read side
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    Reset,
    Aborted,
}

/// A bidirectional stream.
///
/// Dropping the stream ends its write side.
pub struct MuxStream {
    key: StreamKey,
    id: u64,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<MuxShared>,
    write_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        key: StreamKey,
        id: u64,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        shared: Arc<MuxShared>,
    ) -> Self {
        Self {
            key,
            id,
            inbound,
            shared,
            write_closed: false,
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Stream origin
    pub fn origin(&self) -> Origin {
        self.key.origin
    }

    /// Full stream key
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Slot id, matching the id on this stream's lifecycle events
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `data` for the remote, split into frames as needed.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::StreamEnded`] after [`Self::end`] and
    /// [`MuxError::SessionClosed`] once the session is gone.
    pub fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        if self.write_closed {
            return Err(MuxError::StreamEnded);
        }
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.shared.send_data(&self.key, chunk.to_vec())?;
        }
        Ok(())
    }

    /// Receive the next chunk; `Ok(None)` once the remote ended its side.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::StreamReset`] if the remote aborted the stream and
    /// [`MuxError::SessionClosed`] if the session died first.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, MuxError> {
        match self.inbound.recv().await {
            Some(Inbound::Data(data)) => Ok(Some(data)),
            Some(Inbound::Reset) => Err(MuxError::StreamReset),
            Some(Inbound::Aborted) => Err(MuxError::SessionClosed),
            None => Ok(None),
        }
    }

    /// Read until the remote ends the stream, failing past `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PayloadTooLarge`] when more than `limit` bytes
    /// arrive, plus any error from [`Self::read`].
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, MuxError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.read().await? {
            if buf.len() + chunk.len() > limit {
                return Err(MuxError::PayloadTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// End the local write side. The read side stays open.
    pub fn end(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            self.shared.end_local(&self.key, self.id);
        }
    }

    /// Abort the stream in both directions.
    pub fn reset(mut self) {
        self.write_closed = true;
        self.shared.reset_local(&self.key, self.id);
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.write_closed {
            self.shared.end_local(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}
