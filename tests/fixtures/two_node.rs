//! Two-node test fixture for integration testing
//!
//! Provides a pair of session managers wired to one in-process rendezvous:
//! - Connection establishment through a shared topic
//! - Stream exchange between the resulting peers
//! - Teardown of both nodes
//!
//! # Example
//!
//! ```no_run
//! use tether_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_stream() {
//!     let fixture = TwoNodeFixture::new().await.unwrap();
//!     let (alice_peer, bob_peer) = fixture.connect().await.unwrap();
//!
//!     let stream = alice_peer.create_stream("example").unwrap();
//!     // ... test streams ...
//!
//!     fixture.cleanup().await.unwrap();
//! }
//! ```

use crate::test_helpers::{TEST_TIMEOUT, init_tracing};
use std::sync::Arc;
use tether_core::{
    Identity, JoinOptions, Peer, Result, SessionManager, TetherConfig, TetherError, Topic,
};
use tether_discovery::{LocalSwarm, LocalSwarmConfig, Rendezvous};

/// Start a session manager registered with `rendezvous`
///
/// # Errors
///
/// Returns any error from [`SessionManager::new`].
pub async fn spawn_node(rendezvous: &Arc<Rendezvous>, config: TetherConfig) -> Result<SessionManager> {
    let identity = Identity::generate();
    let (swarm, connections) =
        LocalSwarm::new(rendezvous, *identity.public_key(), LocalSwarmConfig::default());
    SessionManager::new(identity, config, Arc::new(swarm), connections).await
}

/// Two-node test fixture
pub struct TwoNodeFixture {
    /// Shared rendezvous
    pub rendezvous: Arc<Rendezvous>,
    /// Announcing node
    pub alice: SessionManager,
    /// Looking-up node
    pub bob: SessionManager,
    /// Topic the nodes meet on
    pub topic: Topic,
}

impl TwoNodeFixture {
    /// Create two nodes with the default configuration
    ///
    /// # Errors
    ///
    /// Returns any error from starting either node.
    pub async fn new() -> Result<Self> {
        Self::with_config(TetherConfig::default()).await
    }

    /// Create two nodes sharing `config`
    ///
    /// # Errors
    ///
    /// Returns any error from starting either node.
    pub async fn with_config(config: TetherConfig) -> Result<Self> {
        init_tracing();
        let rendezvous = Rendezvous::new();
        let alice = spawn_node(&rendezvous, config.clone()).await?;
        let bob = spawn_node(&rendezvous, config).await?;

        Ok(Self {
            rendezvous,
            alice,
            bob,
            topic: Topic::new([0x42; 32]),
        })
    }

    /// Connect the nodes: alice announces the topic, bob looks it up.
    ///
    /// Returns alice's peer for bob and bob's peer for alice, both ready.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Timeout`] if the nodes fail to connect.
    pub async fn connect(&self) -> Result<(Arc<Peer>, Arc<Peer>)> {
        self.alice.join(self.topic, JoinOptions::announce_only()).await?;

        let alice_key = *self.alice.public_key();
        let bob_key = *self.bob.public_key();

        let connecting = async {
            tokio::try_join!(
                self.alice
                    .find_by_topic_and_public_key(self.topic, &bob_key, JoinOptions::announce_only()),
                self.bob
                    .find_by_topic_and_public_key(self.topic, &alice_key, JoinOptions::lookup_only()),
            )
        };

        tokio::time::timeout(TEST_TIMEOUT, connecting)
            .await
            .map_err(|_| TetherError::timeout("fixture connect"))?
    }

    /// Destroy both nodes
    ///
    /// # Errors
    ///
    /// Returns the first destroy error.
    pub async fn cleanup(self) -> Result<()> {
        let (alice, bob) = tokio::join!(self.alice.destroy(), self.bob.destroy());
        alice.and(bob)
    }
}
