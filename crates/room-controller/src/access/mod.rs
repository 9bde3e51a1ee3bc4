//! Roles, permissions, and the per-room access policy.

pub mod policy;
pub mod roles;

pub use policy::{Access, Permission, PolicyOverrides, RoomPolicy};
pub use roles::{Role, RoleId};
