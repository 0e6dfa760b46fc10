//! # Tether Discovery
//!
//! In-process rendezvous implementing the [`tether_core::Discovery`]
//! collaborator contract.
//!
//! Every node registers with a shared [`Rendezvous`]. Joining a topic with
//! `announce` makes a node reachable under it; joining with `lookup` dials
//! every node announcing it. Connections are in-memory duplex pipes, so any
//! number of nodes can run inside one process:
//!
//! ```text
//!   node A ──join(t, lookup)──►┌────────────┐◄──join(t, announce)── node B
//!                              │ Rendezvous │
//!   node A ◄══ duplex pipe ═══►└────────────┘                       node B
//! ```
//!
//! The same remote may be dialed more than once when lookups race; the
//! per-node key bookkeeping in [`LocalConnection`] settles those duplicates.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::{Identity, SessionManager, TetherConfig};
//! use tether_discovery::{LocalSwarm, LocalSwarmConfig, Rendezvous};
//!
//! # async fn demo() -> tether_core::Result<()> {
//! let rendezvous = Rendezvous::new();
//! let identity = Identity::generate();
//! let (swarm, connections) =
//!     LocalSwarm::new(&rendezvous, *identity.public_key(), LocalSwarmConfig::default());
//! let manager =
//!     SessionManager::new(identity, TetherConfig::default(), Arc::new(swarm), connections).await?;
//! # manager.destroy().await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod swarm;

pub use config::LocalSwarmConfig;
pub use connection::LocalConnection;
pub use swarm::{LocalSwarm, Rendezvous};
