//! # Tether Mux
//!
//! Named-stream multiplexing over a single secure channel.
//!
//! A [`Multiplexer`] turns one ordered message pipe into any number of
//! bidirectional byte streams:
//!
//! ```text
//!  application streams           one secure channel
//!  ┌──────────┐
//!  │ "example"├──┐            ┌──────────────────────┐
//!  └──────────┘  ├── frames ─►│ Noise transport msgs │──► remote
//!  ┌──────────┐  │            └──────────────────────┘
//!  │ "topics" ├──┘
//!  └──────────┘
//! ```
//!
//! Every stream is addressed by name plus [`Origin`]: streams opened by each
//! side live in separate namespaces, and shared streams are joined by name.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod mux;
pub mod stream;
pub mod transport;

pub use error::{FrameError, MuxError};
pub use frame::{Frame, FrameType, Namespace};
pub use mux::{MuxEvent, Multiplexer};
pub use stream::{MuxStream, Origin, StreamKey};
pub use transport::{FrameSink, FrameSource};

/// Fixed frame header: type, namespace, name length
pub const FRAME_HEADER_SIZE: usize = 4;

/// Longest stream name in bytes
pub const MAX_NAME_LEN: usize = 1024;

/// Largest payload carried by a single data frame
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

const _: () = assert!(
    FRAME_HEADER_SIZE + MAX_NAME_LEN + MAX_PAYLOAD_SIZE <= tether_crypto::MAX_PLAINTEXT_SIZE
);
