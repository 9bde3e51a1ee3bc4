//! The per-room access policy.
//!
//! A `RoomPolicy` is built once at room construction from the built-in
//! tables merged with deployment overrides, and never mutated afterwards.
//! It answers two questions as pure role-set lookups: does a role set
//! grant an access kind (lock/lobby bypass), and does it grant a
//! permission kind (a gated action). The fail-open rule ("allow when
//! role missing") needs to know which joined peers currently hold a
//! permission, so it lives in the room, not here; the policy only
//! records which permission kinds fall open.

use crate::access::roles::{self, Role, RoleId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Access kinds gate admission bypasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Access {
    /// Join directly even when the room is locked.
    BypassRoomLock,
    /// Skip the lobby while the room is unlocked.
    BypassLobby,
}

/// Permission kinds gate mutating actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    ChangeRoomLock,
    PromotePeer,
    ModifyRole,
    SendChat,
    ModerateChat,
    ShareAudio,
    ShareVideo,
    ShareScreen,
    ExtraVideo,
    ShareFile,
    ModerateFiles,
    ModerateRoom,
    LocalRecordRoom,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::ChangeRoomLock => "changeRoomLock",
            Permission::PromotePeer => "promotePeer",
            Permission::ModifyRole => "modifyRole",
            Permission::SendChat => "sendChat",
            Permission::ModerateChat => "moderateChat",
            Permission::ShareAudio => "shareAudio",
            Permission::ShareVideo => "shareVideo",
            Permission::ShareScreen => "shareScreen",
            Permission::ExtraVideo => "extraVideo",
            Permission::ShareFile => "shareFile",
            Permission::ModerateFiles => "moderateFiles",
            Permission::ModerateRoom => "moderateRoom",
            Permission::LocalRecordRoom => "localRecordRoom",
        };
        f.write_str(name)
    }
}

/// Deployment overrides merged over the built-in tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverrides {
    /// Replaces the allowed-role list of each listed access kind.
    pub access: HashMap<Access, Vec<RoleId>>,
    /// Replaces the allowed-role list of each listed permission kind.
    pub permissions: HashMap<Permission, Vec<RoleId>>,
    /// Permission kinds that fall open when no joined peer holds them.
    pub allow_when_role_missing: Vec<Permission>,
}

/// Immutable policy snapshot for one room.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    access: HashMap<Access, Vec<RoleId>>,
    permissions: HashMap<Permission, Vec<RoleId>>,
    allow_when_role_missing: HashSet<Permission>,
}

impl RoomPolicy {
    /// Build the policy from the built-in tables plus overrides.
    #[must_use]
    pub fn from_overrides(overrides: &PolicyOverrides) -> Self {
        let mut access: HashMap<Access, Vec<RoleId>> = HashMap::from([
            (Access::BypassRoomLock, vec![roles::ADMIN.id]),
            (Access::BypassLobby, vec![roles::NORMAL.id]),
        ]);

        let mut permissions: HashMap<Permission, Vec<RoleId>> = HashMap::from([
            (Permission::ChangeRoomLock, vec![roles::NORMAL.id]),
            (Permission::PromotePeer, vec![roles::NORMAL.id]),
            (Permission::ModifyRole, vec![roles::MODERATOR.id]),
            (Permission::SendChat, vec![roles::NORMAL.id]),
            (Permission::ModerateChat, vec![roles::MODERATOR.id]),
            (Permission::ShareAudio, vec![roles::NORMAL.id]),
            (Permission::ShareVideo, vec![roles::NORMAL.id]),
            (Permission::ShareScreen, vec![roles::NORMAL.id]),
            (Permission::ExtraVideo, vec![roles::NORMAL.id]),
            (Permission::ShareFile, vec![roles::NORMAL.id]),
            (Permission::ModerateFiles, vec![roles::MODERATOR.id]),
            (Permission::ModerateRoom, vec![roles::MODERATOR.id]),
            (Permission::LocalRecordRoom, vec![roles::NORMAL.id]),
        ]);

        for (kind, allowed) in &overrides.access {
            access.insert(*kind, allowed.clone());
        }
        for (kind, allowed) in &overrides.permissions {
            permissions.insert(*kind, allowed.clone());
        }

        Self {
            access,
            permissions,
            allow_when_role_missing: overrides.allow_when_role_missing.iter().copied().collect(),
        }
    }

    /// Whether a role set grants the permission by table lookup alone.
    #[must_use]
    pub fn permits(&self, held: &[Role], permission: Permission) -> bool {
        self.permissions
            .get(&permission)
            .is_some_and(|allowed| held.iter().any(|role| allowed.contains(&role.id)))
    }

    /// Whether a role set grants the access kind. No fallback.
    #[must_use]
    pub fn grants_access(&self, held: &[Role], access: Access) -> bool {
        self.access
            .get(&access)
            .is_some_and(|allowed| held.iter().any(|role| allowed.contains(&role.id)))
    }

    /// Whether the permission falls open when no joined peer holds it.
    #[must_use]
    pub fn fails_open(&self, permission: Permission) -> bool {
        self.allow_when_role_missing.contains(&permission)
    }
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self::from_overrides(&PolicyOverrides::default())
    }
}
