//! `Noise_XX` handshake and secure channel.
//!
//! The handshake authenticates both static keys:
//!
//! ```text
//! Initiator                     Responder
//!     |                              |
//!     |------ Noise msg1 (e) ------->|
//!     |                              |
//!     |<-- Noise msg2 (e,ee,s,es) ---|
//!     |                              |
//!     |------ Noise msg3 (s,se) ---->|
//!     |                              |
//!     |     [Transport mode]         |
//! ```
//!
//! After the handshake the channel switches to stateless transport mode so
//! the reader and writer halves can each keep their own nonce counter and be
//! driven from different tasks.

use crate::keys::KeyPair;
use crate::{CryptoError, MAX_NOISE_MESSAGE_SIZE, MAX_PLAINTEXT_SIZE, NOISE_PATTERN};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, StatelessTransportState};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Authenticated channel produced by a completed handshake.
pub struct SecureChannel<S> {
    io: S,
    transport: StatelessTransportState,
    remote_static: [u8; 32],
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the `Noise_XX` handshake over `io`.
    ///
    /// On success the remote's static public key has been verified by the
    /// handshake transcript and is available through [`Self::remote_static`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] on any Noise failure,
    /// [`CryptoError::InvalidRemoteKey`] if the remote key is missing or
    /// malformed, and I/O errors from the underlying stream.
    pub async fn handshake(
        mut io: S,
        initiator: bool,
        keypair: &KeyPair,
    ) -> Result<Self, CryptoError> {
        let mut state = build_state(initiator, keypair)?;
        let mut message = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE_SIZE];

        if initiator {
            send_handshake(&mut io, &mut state, &mut message).await?;
            recv_handshake(&mut io, &mut state, &mut payload).await?;
            send_handshake(&mut io, &mut state, &mut message).await?;
        } else {
            recv_handshake(&mut io, &mut state, &mut payload).await?;
            send_handshake(&mut io, &mut state, &mut message).await?;
            recv_handshake(&mut io, &mut state, &mut payload).await?;
        }

        let remote_static: [u8; 32] = state
            .get_remote_static()
            .and_then(|key| key.try_into().ok())
            .ok_or(CryptoError::InvalidRemoteKey)?;

        let transport = state.into_stateless_transport_mode()?;

        tracing::trace!(
            "Noise handshake complete (initiator: {}), remote {}",
            initiator,
            hex::encode(&remote_static[..8])
        );

        Ok(Self {
            io,
            transport,
            remote_static,
        })
    }

    /// The remote's authenticated static public key.
    #[must_use]
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Split into independently owned reader and writer halves.
    pub fn split(self) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>) {
        let transport = Arc::new(self.transport);
        let (read_half, write_half) = tokio::io::split(self.io);

        let reader = SecureReader {
            io: read_half,
            transport: Arc::clone(&transport),
            nonce: 0,
            buf: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        };
        let writer = SecureWriter {
            io: write_half,
            transport,
            nonce: 0,
            buf: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        };

        (reader, writer)
    }
}

/// Receiving half of a secure channel.
pub struct SecureReader<R> {
    io: R,
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Receive and decrypt the next message.
    ///
    /// Returns `Ok(None)` when the remote closed the stream cleanly on a
    /// message boundary.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails and
    /// [`CryptoError::UnexpectedEof`] if the stream ends mid-message.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, CryptoError> {
        let Some(ciphertext) = read_frame(&mut self.io).await? else {
            return Ok(None);
        };

        let len = self
            .transport
            .read_message(self.nonce, &ciphertext, &mut self.buf)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;

        Ok(Some(self.buf[..len].to_vec()))
    }
}

/// Sending half of a secure channel.
pub struct SecureWriter<W> {
    io: W,
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    /// Encrypt and send one message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MessageTooLarge`] if `plaintext` exceeds
    /// [`MAX_PLAINTEXT_SIZE`].
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(CryptoError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT_SIZE,
            });
        }

        let len = self
            .transport
            .write_message(self.nonce, plaintext, &mut self.buf)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;

        write_frame(&mut self.io, &self.buf[..len]).await
    }

    /// Gracefully end the channel; the remote reader observes a clean close.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from shutting down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), CryptoError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

fn build_state(initiator: bool, keypair: &KeyPair) -> Result<HandshakeState, CryptoError> {
    let params: NoiseParams = NOISE_PATTERN.parse()?;
    let secret = keypair.secret_bytes();
    let builder = Builder::new(params).local_private_key(&secret[..])?;

    let state = if initiator {
        builder.build_initiator()?
    } else {
        builder.build_responder()?
    };
    Ok(state)
}

async fn send_handshake<S: AsyncWrite + Unpin>(
    io: &mut S,
    state: &mut HandshakeState,
    message: &mut [u8],
) -> Result<(), CryptoError> {
    let len = state.write_message(&[], message)?;
    write_frame(io, &message[..len]).await
}

async fn recv_handshake<S: AsyncRead + Unpin>(
    io: &mut S,
    state: &mut HandshakeState,
    payload: &mut [u8],
) -> Result<(), CryptoError> {
    let message = read_frame(io).await?.ok_or(CryptoError::UnexpectedEof)?;
    state.read_message(&message, payload)?;
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> Result<(), CryptoError> {
    let len = u16::try_from(data.len()).map_err(|_| CryptoError::MessageTooLarge {
        size: data.len(),
        max: MAX_NOISE_MESSAGE_SIZE,
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<Vec<u8>>, CryptoError> {
    let mut len = [0u8; 2];
    if io.read(&mut len[..1]).await? == 0 {
        return Ok(None);
    }
    io.read_exact(&mut len[1..])
        .await
        .map_err(|_| CryptoError::UnexpectedEof)?;

    let mut data = vec![0u8; usize::from(u16::from_be_bytes(len))];
    io.read_exact(&mut data)
        .await
        .map_err(|_| CryptoError::UnexpectedEof)?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    async fn channel_pair(
        a: &KeyPair,
        b: &KeyPair,
    ) -> (SecureChannel<DuplexStream>, SecureChannel<DuplexStream>) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (init, resp) = tokio::join!(
            SecureChannel::handshake(left, true, a),
            SecureChannel::handshake(right, false, b),
        );
        (init.unwrap(), resp.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_authenticates_static_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let (init, resp) = channel_pair(&a, &b).await;

        assert_eq!(init.remote_static(), b.public_key());
        assert_eq!(resp.remote_static(), a.public_key());
    }

    #[tokio::test]
    async fn test_transport_messages_both_directions() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (init, resp) = channel_pair(&a, &b).await;

        let (mut a_reader, mut a_writer) = init.split();
        let (mut b_reader, mut b_writer) = resp.split();

        a_writer.send(b"hello").await.unwrap();
        a_writer.send(b"world").await.unwrap();
        b_writer.send(b"back").await.unwrap();

        assert_eq!(b_reader.recv().await.unwrap().unwrap(), b"hello");
        assert_eq!(b_reader.recv().await.unwrap().unwrap(), b"world");
        assert_eq!(a_reader.recv().await.unwrap().unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_shutdown_is_clean_eof() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (init, resp) = channel_pair(&a, &b).await;

        let (_a_reader, mut a_writer) = init.split();
        let (mut b_reader, _b_writer) = resp.split();

        a_writer.send(b"last").await.unwrap();
        a_writer.shutdown().await.unwrap();

        assert_eq!(b_reader.recv().await.unwrap().unwrap(), b"last");
        assert!(b_reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (init, _resp) = channel_pair(&a, &b).await;
        let (_reader, mut writer) = init.split();

        let big = vec![0u8; MAX_PLAINTEXT_SIZE + 1];
        let result = writer.send(&big).await;
        assert!(matches!(result, Err(CryptoError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_tampered_message_fails_authentication() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (init, resp) = channel_pair(&a, &b).await;

        let (mut reader, _writer) = resp.split();
        let SecureChannel { mut io, .. } = init;

        // Hand-crafted frame that was never produced by the sender's cipher
        write_frame(&mut io, &[0xAB; 40]).await.unwrap();

        let result = reader.recv().await;
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_handshake_fails_on_closed_stream() {
        let a = KeyPair::generate();
        let (left, right) = tokio::io::duplex(1024);
        drop(right);

        let result = SecureChannel::handshake(left, true, &a).await;
        assert!(result.is_err());
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Arbitrary bytes never panic the frame reader, and a frame is
            /// only returned when the length prefix is fully backed
            #[test]
            fn read_frame_handles_arbitrary_input(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
                let mut input = &bytes[..];
                let result = block_on(read_frame(&mut input));
                match result {
                    Ok(None) => prop_assert!(bytes.is_empty()),
                    Ok(Some(frame)) => {
                        let declared = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
                        prop_assert_eq!(frame.len(), declared);
                        prop_assert_eq!(&frame[..], &bytes[2..2 + declared]);
                    }
                    Err(e) => prop_assert!(matches!(e, CryptoError::UnexpectedEof)),
                }
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Whatever is sent arrives intact and in order
            #[test]
            fn transport_roundtrip(
                messages in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..2048),
                    1..8,
                )
            ) {
                let received = block_on(async {
                    let a = KeyPair::generate();
                    let b = KeyPair::generate();
                    let (init, resp) = channel_pair(&a, &b).await;
                    let (_a_reader, mut writer) = init.split();
                    let (mut reader, _b_writer) = resp.split();

                    for message in &messages {
                        writer.send(message).await.unwrap();
                    }
                    let mut received = Vec::new();
                    for _ in &messages {
                        received.push(reader.recv().await.unwrap().unwrap());
                    }
                    received
                });
                prop_assert_eq!(received, messages);
            }
        }
    }
}
