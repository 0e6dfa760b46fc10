//! Reusable multi-node fixtures

mod two_node;

pub use two_node::{TwoNodeFixture, spawn_node};
