//! User roles.
//!
//! A peer holds an ordered, non-empty set of roles. Every peer gets
//! [`NORMAL`] on arrival; authentication and moderation add more. A role
//! carries a numeric level used for moderation ordering (an actor may
//! only grant or revoke roles at or below its own highest level) and a
//! `promotable` flag marking roles that can be granted at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric identifier of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub u32);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Role {
    pub id: RoleId,
    pub label: &'static str,
    /// Moderation level; higher outranks lower.
    pub level: u32,
    /// Whether this role can be granted or revoked at runtime.
    pub promotable: bool,
}

/// Full administrative control, bypasses the room lock.
pub const ADMIN: Role = Role {
    id: RoleId(2529),
    label: "admin",
    level: 50,
    promotable: false,
};

/// Moderation rights: role changes, chat/file moderation, room moderation.
pub const MODERATOR: Role = Role {
    id: RoleId(5337),
    label: "moderator",
    level: 40,
    promotable: true,
};

/// A signed-in user.
pub const AUTHENTICATED: Role = Role {
    id: RoleId(5714),
    label: "authenticated",
    level: 30,
    promotable: false,
};

/// Baseline participant role; held by every peer.
pub const NORMAL: Role = Role {
    id: RoleId(4261),
    label: "normal",
    level: 20,
    promotable: false,
};

/// All built-in roles, highest level first.
pub const ALL: &[Role] = &[ADMIN, MODERATOR, AUTHENTICATED, NORMAL];

/// Look up a built-in role by id.
#[must_use]
pub fn find(id: RoleId) -> Option<Role> {
    ALL.iter().copied().find(|role| role.id == id)
}

/// Highest level among a set of held roles (0 if empty).
#[must_use]
pub fn max_level(roles: &[Role]) -> u32 {
    roles.iter().map(|role| role.level).max().unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering_by_level() {
        assert!(ADMIN.level > MODERATOR.level);
        assert!(MODERATOR.level > AUTHENTICATED.level);
        assert!(AUTHENTICATED.level > NORMAL.level);
    }

    #[test]
    fn test_find_known_and_unknown() {
        assert_eq!(find(MODERATOR.id), Some(MODERATOR));
        assert_eq!(find(RoleId(1)), None);
    }

    #[test]
    fn test_only_moderator_is_promotable() {
        let promotable: Vec<_> = ALL.iter().filter(|role| role.promotable).collect();
        assert_eq!(promotable, vec![&MODERATOR]);
    }

    #[test]
    fn test_max_level() {
        assert_eq!(max_level(&[NORMAL, MODERATOR]), 40);
        assert_eq!(max_level(&[NORMAL]), 20);
        assert_eq!(max_level(&[]), 0);
    }
}
