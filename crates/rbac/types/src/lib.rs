//! RBAC Types - users, roles, groups and the permissions they carry
//!
//! These types are pure data. Lookups live in `rbac-identity`, and the
//! effective-permission computation lives in `rbac-resolver`.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a user account
    UserId
);
string_id!(
    /// Identifier of a role
    RoleId
);
string_id!(
    /// Identifier of a group
    GroupId
);
string_id!(
    /// Unique, human-facing role name (e.g. `manager`)
    RoleName
);

// ── Permissions ──────────────────────────────────────────────────────

/// Wildcard token usable as resource or action
pub const WILDCARD: &str = "*";

/// A `(resource, action)` pair, written `resource:action`.
///
/// `*` is a wildcard in either position. The bare string `*` parses to
/// `(*, *)`, the super-admin permission.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// The super-admin permission `*`
    pub fn super_admin() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_super_admin(&self) -> bool {
        self.resource == WILDCARD && self.action == WILDCARD
    }

    /// Whether holding `self` satisfies a check for `required`.
    ///
    /// Matches the exact pair, `resource:*`, `*:action`, or `*`.
    pub fn grants(&self, required: &Permission) -> bool {
        let resource_ok = self.resource == WILDCARD || self.resource == required.resource;
        let action_ok = self.action == WILDCARD || self.action == required.action;
        resource_ok && action_ok
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_super_admin() {
            write!(f, "{}", WILDCARD)
        } else {
            write!(f, "{}:{}", self.resource, self.action)
        }
    }
}

impl FromStr for Permission {
    type Err = PermissionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw == WILDCARD {
            return Ok(Self::super_admin());
        }
        let (resource, action) = raw
            .split_once(':')
            .ok_or_else(|| PermissionParseError(raw.to_string()))?;
        if resource.is_empty() || action.is_empty() || action.contains(':') {
            return Err(PermissionParseError(raw.to_string()));
        }
        Ok(Self::new(resource, action))
    }
}

impl TryFrom<String> for Permission {
    type Error = PermissionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}

/// Returned when a permission string is not `resource:action` or `*`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid permission `{0}`: expected `resource:action` or `*`")]
pub struct PermissionParseError(pub String);

// ── Principals ───────────────────────────────────────────────────────

/// A user account
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Deactivated users keep their history but cannot act
    pub active: bool,
    /// Locked-out users cannot act until unlocked
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: None,
            active: true,
            locked: false,
            roles: BTreeSet::new(),
            groups: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Active and not locked out
    pub fn can_act(&self) -> bool {
        self.active && !self.locked
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A named bundle of permissions
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: RoleName,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered, without duplicates
    pub permissions: Vec<Permission>,
    /// System roles cannot be edited or deleted, only superseded
    #[serde(default)]
    pub is_system_role: bool,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<RoleName>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            permissions: Vec::new(),
            is_system_role: false,
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.add_permission(permission);
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system_role = true;
        self
    }

    /// Append a permission, keeping first-insertion order
    pub fn add_permission(&mut self, permission: Permission) {
        if !self.permissions.contains(&permission) {
            self.permissions.push(permission);
        }
    }

    pub fn grants(&self, required: &Permission) -> bool {
        self.permissions.iter().any(|p| p.grants(required))
    }
}

/// A group of users, optionally nested under a parent group
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Not guaranteed acyclic; resolvers must guard against loops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<GroupId>,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
    /// Roles granted to every transitive member
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent: None,
            members: BTreeSet::new(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<GroupId>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

impl From<String> for RoleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<String> for GroupId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<String> for RoleName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_permission() {
        let p: Permission = "approvals:write".parse().unwrap();
        assert_eq!(p, Permission::new("approvals", "write"));
        assert_eq!(p.to_string(), "approvals:write");

        let all: Permission = "*".parse().unwrap();
        assert!(all.is_super_admin());
        assert_eq!(all.to_string(), "*");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("approvals".parse::<Permission>().is_err());
        assert!(":write".parse::<Permission>().is_err());
        assert!("approvals:".parse::<Permission>().is_err());
        assert!("a:b:c".parse::<Permission>().is_err());
    }

    #[test]
    fn test_wildcard_grants() {
        let required = Permission::new("approvals", "write");
        assert!(Permission::new("approvals", "write").grants(&required));
        assert!(Permission::new("approvals", "*").grants(&required));
        assert!(Permission::new("*", "write").grants(&required));
        assert!(Permission::super_admin().grants(&required));
        assert!(!Permission::new("approvals", "read").grants(&required));
        assert!(!Permission::new("tickets", "*").grants(&required));
    }

    #[test]
    fn test_role_dedupes_permissions() {
        let role = Role::new("r1", "manager")
            .with_permission(Permission::new("approvals", "write"))
            .with_permission(Permission::new("approvals", "read"))
            .with_permission(Permission::new("approvals", "write"));
        assert_eq!(role.permissions.len(), 2);
        assert_eq!(role.permissions[0].action, "write");
    }

    #[test]
    fn test_permission_serde_as_string() {
        let role = Role::new("r1", "admin").with_permission(Permission::super_admin());
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json["permissions"][0], "*");

        let back: Role = serde_json::from_value(json).unwrap();
        assert!(back.permissions[0].is_super_admin());
    }

    #[test]
    fn test_user_can_act() {
        let mut user = User::new("u1", "Alice");
        assert!(user.can_act());
        user.locked = true;
        assert!(!user.can_act());
    }

    proptest! {
        #[test]
        fn prop_super_admin_grants_everything(resource in "[a-z]{1,8}", action in "[a-z]{1,8}") {
            prop_assert!(Permission::super_admin().grants(&Permission::new(resource, action)));
        }

        #[test]
        fn prop_resource_wildcard_is_scoped(
            held in "[a-z]{1,8}",
            resource in "[a-z]{1,8}",
            action in "[a-z]{1,8}",
        ) {
            let grant = Permission::new(held.clone(), WILDCARD);
            let required = Permission::new(resource.clone(), action);
            prop_assert_eq!(grant.grants(&required), held == resource);
        }

        #[test]
        fn prop_display_parse_round_trip(resource in "[a-z]{1,8}", action in "[a-z*]{1,8}") {
            let p = Permission::new(resource, action);
            let parsed: Permission = p.to_string().parse().unwrap();
            prop_assert_eq!(parsed, p);
        }
    }
}
