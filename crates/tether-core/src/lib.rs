//! # Tether Core
//!
//! Authenticated peer sessions on top of a discovery layer.
//!
//! Discovery hands over raw connected sockets; this crate authenticates each
//! remote with a Noise XX handshake, settles duplicate connections between
//! the same pair of nodes, exchanges topic metadata, and exposes every
//! resulting [`Peer`] as a set of named streams. Peers disconnect themselves
//! once their last stream closes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                SessionManager                │
//! │   join / leave / find / destroy / events     │
//! ├──────────────────────────────────────────────┤
//! │  Peer  │  Peer  │  Peer  │  ...   (registry) │
//! ├──────────────────────────────────────────────┤
//! │    tether-mux: named streams per session     │
//! ├──────────────────────────────────────────────┤
//! │    tether-crypto: Noise XX secure channel    │
//! ├──────────────────────────────────────────────┤
//! │    Discovery (trait): raw sockets + info     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::{Discovery, IncomingConnection, SessionEvent, SessionManager, TetherConfig};
//! use tokio::sync::mpsc;
//!
//! async fn run(
//!     discovery: Arc<dyn Discovery>,
//!     connections: mpsc::UnboundedReceiver<IncomingConnection>,
//! ) -> tether_core::Result<()> {
//!     let manager =
//!         SessionManager::with_random_identity(TetherConfig::default(), discovery, connections)
//!             .await?;
//!     let mut events = manager.subscribe();
//!
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::PeerReady(peer) = event {
//!             let stream = peer.create_stream("example")?;
//!             stream.write(b"Hello World")?;
//!         }
//!     }
//!
//!     manager.destroy().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod metadata;
pub mod peer;
mod registry;
pub mod topic;
pub mod tracker;

pub use config::TetherConfig;
pub use discovery::{BoxedSocket, ConnectionInfo, Discovery, IncomingConnection, JoinOptions, RawSocket};
pub use error::{Result, TetherError};
pub use events::{PeerEvent, SessionEvent};
pub use identity::{Identity, PeerId};
pub use manager::SessionManager;
pub use peer::{Peer, PeerState};
pub use tether_mux::MuxStream;
pub use topic::{Topic, TopicSet};
