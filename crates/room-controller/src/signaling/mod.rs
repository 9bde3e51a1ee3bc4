//! The signaling protocol and per-peer socket handles.

pub mod protocol;
pub mod socket;

pub use protocol::{ClientFrame, ClientRequest, Notification, ReplyError};
pub use socket::{socket_pair, OutboundFrame, PeerSocket, ReplyResolver, SocketServerEnd};
