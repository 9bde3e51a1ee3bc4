//! Common types shared across Atrium crates.
//!
//! This crate holds the identifier newtypes used on every component
//! boundary, the secret-handling types used for sensitive configuration,
//! and the room-scoped join token signer.

pub mod secret;
pub mod token;
pub mod types;
