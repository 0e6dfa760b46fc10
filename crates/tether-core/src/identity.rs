//! Node identity
//!
//! A Tether node is identified by the public half of its long-term X25519
//! static key. The same key authenticates the node in every Noise handshake,
//! so a peer's identity is exactly what the handshake proved.
//!
//! # Example
//!
//! ```
//! use tether_core::Identity;
//!
//! let identity = Identity::generate();
//! println!("Node ID: {}", hex::encode(identity.public_key()));
//! ```

use tether_crypto::KeyPair;

/// Peer identifier: a remote's authenticated static public key
pub type PeerId = [u8; 32];

/// Node identity wrapping the static key pair
#[derive(Clone)]
pub struct Identity {
    keypair: KeyPair,
}

impl Identity {
    /// Generate a fresh random identity
    #[must_use]
    pub fn generate() -> Self {
        Self {
            keypair: KeyPair::generate(),
        }
    }

    /// Use an existing key pair
    #[must_use]
    pub fn from_keypair(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Public key, used as this node's [`PeerId`]
    #[must_use]
    pub fn public_key(&self) -> &PeerId {
        self.keypair.public_key()
    }

    /// Key pair for Noise handshakes
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(&self.public_key()[..8]))
            .finish_non_exhaustive()
    }
}
