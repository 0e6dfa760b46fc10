//! # Tether Crypto
//!
//! Cryptographic layer for Tether sessions.
//!
//! This crate provides:
//! - Long-term X25519 static key pairs ([`KeyPair`])
//! - `Noise_XX` mutual authentication over any async byte stream
//! - A message-oriented secure channel that splits into independent
//!   reader and writer halves after the handshake
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | AEAD | ChaCha20-Poly1305 |
//! | Hash | BLAKE2s |
//! | Handshake | `Noise_XX` |
//!
//! ## Wire Format
//!
//! Every Noise message (handshake or transport) is prefixed with a 2-byte
//! big-endian length. Transport messages carry at most
//! [`MAX_PLAINTEXT_SIZE`] bytes of plaintext.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod keys;
pub mod noise;

pub use error::CryptoError;
pub use keys::KeyPair;
pub use noise::{SecureChannel, SecureReader, SecureWriter};

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// Largest Noise message, including the AEAD tag
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// ChaCha20-Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Largest plaintext carried by a single transport message
pub const MAX_PLAINTEXT_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - TAG_SIZE;

/// Noise protocol name used for every handshake
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";
