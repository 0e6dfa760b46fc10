//! Message transport abstraction underneath the multiplexer.
//!
//! The multiplexer only needs an ordered, reliable, message-oriented pipe in
//! each direction. The secure channel halves from `tether-crypto` provide
//! exactly that.

use async_trait::async_trait;
use tether_crypto::{CryptoError, SecureReader, SecureWriter};
use tokio::io::{AsyncRead, AsyncWrite};

/// Inbound message pipe
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Receive the next message, `Ok(None)` on clean end of stream
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, CryptoError>;
}

/// Outbound message pipe
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one message
    async fn send(&mut self, message: &[u8]) -> Result<(), CryptoError>;

    /// Gracefully close the outbound direction
    async fn close(&mut self) -> Result<(), CryptoError>;
}

#[async_trait]
impl<R> FrameSource for SecureReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, CryptoError> {
        SecureReader::recv(self).await
    }
}

#[async_trait]
impl<W> FrameSink for SecureWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        SecureWriter::send(self, message).await
    }

    async fn close(&mut self) -> Result<(), CryptoError> {
        self.shutdown().await
    }
}
