//! The room orchestration layer.
//!
//! One actor per room owns all room state: admission and lobby, the
//! serialized join queue, router placement, media session orchestration,
//! permission checks, history, and lifecycle. All mutating operations
//! for a room execute on its single-threaded timeline; media engine
//! events re-enter through the mailbox.

pub mod audio;
pub mod balancer;
pub mod join_queue;
pub mod lobby;
mod media;
pub mod peer;
#[allow(clippy::module_inception)]
mod room;

pub use room::{
    MediaEvent, NewPeer, RequestReply, RoomContext, RoomHandle, RoomMessage, RoomStatus,
};
pub(crate) use room::RoomActor;
