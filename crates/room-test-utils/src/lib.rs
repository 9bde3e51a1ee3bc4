//! Test utilities for the Atrium room controller.
//!
//! Provides a scriptable peer-socket harness, config and registry
//! fixtures, and re-exports the in-process engine with its simulation
//! switches. Test-support code is allowed to panic on misuse.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod fixtures;
pub mod test_socket;

pub use fixtures::{new_peer, spawn_registry, test_config};
pub use media_engine::inprocess::InProcessEngine;
pub use test_socket::TestSocket;
