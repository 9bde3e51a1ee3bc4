//! Atrium Room Controller library.
//!
//! The control plane of a real-time multi-party media room: it admits
//! participants, assigns them to load-balanced media routers, mediates
//! permission-gated actions, relays signaling between peers, and tears
//! down idle rooms.
//!
//! # Architecture
//!
//! One actor per room owns all room state and runs every mutating
//! operation on a single-threaded timeline:
//!
//! ```text
//! RegistryActor (singleton per instance)
//! ├── owns the server-wide peer routing directory
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── admission & lobby state machine
//!         ├── join serialization queue
//!         ├── router load balancing & piping
//!         ├── media session orchestration
//!         └── permission engine & lifecycle
//! ```
//!
//! The media engine is an external collaborator behind the traits in
//! the `media-engine` crate; engine events re-enter the room through
//! its mailbox. The signaling edge (WebSocket bridge in [`server`])
//! carries JSON request/notification envelopes and holds no room logic.
//!
//! # Modules
//!
//! - [`access`] - roles, permissions, per-room policy snapshot
//! - [`config`] - service configuration from environment
//! - [`errors`] - error taxonomy with wire code mapping
//! - [`registry`] - server-level room registry
//! - [`room`] - the room actor and its components
//! - [`server`] - WebSocket signaling endpoint and health
//! - [`signaling`] - protocol envelopes and peer sockets
//! - [`turn`] - relay credential fetch

pub mod access;
pub mod config;
pub mod errors;
pub mod registry;
pub mod room;
pub mod server;
pub mod signaling;
pub mod turn;
