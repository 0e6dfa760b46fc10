//! Static X25519 key pairs.
//!
//! A [`KeyPair`] is the long-term identity of a node. Its public half is the
//! value remote peers authenticate during the Noise handshake; its secret
//! half never leaves this crate except as a zeroizing buffer handed to the
//! handshake builder.

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Long-term X25519 key pair.
///
/// # Example
///
/// ```
/// use tether_crypto::KeyPair;
///
/// let keypair = KeyPair::generate();
/// assert_eq!(keypair.public_key().len(), 32);
/// ```
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Restore a key pair from its 32-byte secret.
    ///
    /// The secret is clamped per RFC 7748 by the underlying implementation.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// The public half, used as the node identity.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Export the secret half.
    ///
    /// # Security
    ///
    /// The returned buffer is wiped on drop. Handle with care.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish_non_exhaustive()
    }
}
