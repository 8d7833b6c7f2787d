//! RBAC Identity - the identity and role store
//!
//! [`IdentityStore`] is the read-only lookup contract consumed by the
//! permission resolver and the approval engine. [`InMemoryIdentityStore`]
//! implements it and adds the administrative mutations (user creation,
//! role/group assignment, soft deactivation) that sit outside the engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use rbac_types::{Group, GroupId, Permission, Role, RoleId, RoleName, User, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Read-only identity lookups.
///
/// Missing records are `Ok(None)` / empty, never errors; only backend
/// failures are reported as `Err`.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, id: &UserId) -> IdentityResult<Option<User>>;

    /// Roles directly assigned to the user
    async fn get_roles_for_user(&self, id: &UserId) -> IdentityResult<Vec<Role>>;

    /// Groups the user is a direct member of
    async fn get_groups_for_user(&self, id: &UserId) -> IdentityResult<Vec<Group>>;

    async fn get_role(&self, id: &RoleId) -> IdentityResult<Option<Role>>;

    async fn get_role_by_name(&self, name: &RoleName) -> IdentityResult<Option<Role>>;

    async fn get_group(&self, id: &GroupId) -> IdentityResult<Option<Group>>;

    /// Every known user, including deactivated ones
    async fn list_users(&self) -> IdentityResult<Vec<User>>;
}

#[derive(Default)]
struct IdentityState {
    users: HashMap<UserId, User>,
    roles: HashMap<RoleId, Role>,
    groups: HashMap<GroupId, Group>,
}

/// In-memory identity store
#[derive(Default)]
pub struct InMemoryIdentityStore {
    state: RwLock<IdentityState>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a seed document
    pub fn from_seed(seed: IdentitySeed) -> IdentityResult<Self> {
        let store = Self::new();
        for role in seed.roles {
            store.create_role(role)?;
        }
        for group in seed.groups {
            store.create_group(group)?;
        }
        for user in seed.users {
            store.create_user(user)?;
        }
        Ok(store)
    }

    /// Parse a JSON seed document and build a store from it
    pub fn from_seed_json(raw: &str) -> IdentityResult<Self> {
        let seed: IdentitySeed =
            serde_json::from_str(raw).map_err(|e| IdentityError::InvalidSeed(e.to_string()))?;
        Self::from_seed(seed)
    }

    fn read(&self) -> IdentityResult<std::sync::RwLockReadGuard<'_, IdentityState>> {
        self.state.read().map_err(|_| IdentityError::LockError)
    }

    fn write(&self) -> IdentityResult<std::sync::RwLockWriteGuard<'_, IdentityState>> {
        self.state.write().map_err(|_| IdentityError::LockError)
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Register a user. Role and group references must already exist.
    pub fn create_user(&self, user: User) -> IdentityResult<User> {
        let mut state = self.write()?;
        if state.users.contains_key(&user.id) {
            return Err(IdentityError::DuplicateUser(user.id));
        }
        for role_id in &user.roles {
            if !state.roles.contains_key(role_id) {
                return Err(IdentityError::RoleNotFound(role_id.clone()));
            }
        }
        for group_id in &user.groups {
            let group = state
                .groups
                .get_mut(group_id)
                .ok_or_else(|| IdentityError::GroupNotFound(group_id.clone()))?;
            group.members.insert(user.id.clone());
        }
        state.users.insert(user.id.clone(), user.clone());
        tracing::info!(user_id = %user.id, "User created");
        Ok(user)
    }

    /// Soft-deactivate a user; the record is kept for audit history
    pub fn deactivate_user(&self, id: &UserId) -> IdentityResult<()> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| IdentityError::UserNotFound(id.clone()))?;
        user.active = false;
        tracing::info!(user_id = %id, "User deactivated");
        Ok(())
    }

    pub fn reactivate_user(&self, id: &UserId) -> IdentityResult<()> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| IdentityError::UserNotFound(id.clone()))?;
        user.active = true;
        Ok(())
    }

    pub fn set_locked(&self, id: &UserId, locked: bool) -> IdentityResult<()> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| IdentityError::UserNotFound(id.clone()))?;
        user.locked = locked;
        Ok(())
    }

    // ── Roles ────────────────────────────────────────────────────────

    pub fn create_role(&self, role: Role) -> IdentityResult<Role> {
        let mut state = self.write()?;
        if state.roles.contains_key(&role.id) {
            return Err(IdentityError::DuplicateRoleId(role.id));
        }
        if state.roles.values().any(|r| r.name == role.name) {
            return Err(IdentityError::DuplicateRole(role.name));
        }
        state.roles.insert(role.id.clone(), role.clone());
        tracing::info!(role_id = %role.id, role = %role.name, "Role created");
        Ok(role)
    }

    /// Replace a role's permissions. System roles are immutable.
    pub fn update_role_permissions(
        &self,
        id: &RoleId,
        permissions: Vec<Permission>,
    ) -> IdentityResult<Role> {
        let mut state = self.write()?;
        let role = state
            .roles
            .get_mut(id)
            .ok_or_else(|| IdentityError::RoleNotFound(id.clone()))?;
        if role.is_system_role {
            return Err(IdentityError::SystemRoleImmutable(id.clone()));
        }
        role.permissions.clear();
        for permission in permissions {
            role.add_permission(permission);
        }
        Ok(role.clone())
    }

    /// Delete a non-system role and drop it from every user and group
    pub fn delete_role(&self, id: &RoleId) -> IdentityResult<Role> {
        let mut state = self.write()?;
        match state.roles.get(id) {
            None => return Err(IdentityError::RoleNotFound(id.clone())),
            Some(role) if role.is_system_role => {
                return Err(IdentityError::SystemRoleImmutable(id.clone()))
            }
            Some(_) => {}
        }
        for user in state.users.values_mut() {
            user.roles.remove(id);
        }
        for group in state.groups.values_mut() {
            group.roles.remove(id);
        }
        let removed = state
            .roles
            .remove(id)
            .ok_or_else(|| IdentityError::RoleNotFound(id.clone()))?;
        tracing::info!(role_id = %id, "Role deleted");
        Ok(removed)
    }

    pub fn assign_role(&self, user_id: &UserId, role_id: &RoleId) -> IdentityResult<()> {
        let mut state = self.write()?;
        if !state.roles.contains_key(role_id) {
            return Err(IdentityError::RoleNotFound(role_id.clone()));
        }
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::UserNotFound(user_id.clone()))?;
        user.roles.insert(role_id.clone());
        tracing::debug!(user_id = %user_id, role_id = %role_id, "Role assigned");
        Ok(())
    }

    /// Returns whether the user held the role
    pub fn revoke_role(&self, user_id: &UserId, role_id: &RoleId) -> IdentityResult<bool> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::UserNotFound(user_id.clone()))?;
        let removed = user.roles.remove(role_id);
        tracing::debug!(user_id = %user_id, role_id = %role_id, removed, "Role revoked");
        Ok(removed)
    }

    // ── Groups ───────────────────────────────────────────────────────

    /// Register a group. The parent, if any, must exist; cycles created
    /// later through [`Self::set_group_parent`] are tolerated.
    pub fn create_group(&self, group: Group) -> IdentityResult<Group> {
        let mut state = self.write()?;
        if state.groups.contains_key(&group.id) {
            return Err(IdentityError::DuplicateGroup(group.id));
        }
        if let Some(parent) = &group.parent {
            if !state.groups.contains_key(parent) {
                return Err(IdentityError::GroupNotFound(parent.clone()));
            }
        }
        for role_id in &group.roles {
            if !state.roles.contains_key(role_id) {
                return Err(IdentityError::RoleNotFound(role_id.clone()));
            }
        }
        for member in &group.members {
            let user = state
                .users
                .get_mut(member)
                .ok_or_else(|| IdentityError::UserNotFound(member.clone()))?;
            user.groups.insert(group.id.clone());
        }
        state.groups.insert(group.id.clone(), group.clone());
        tracing::info!(group_id = %group.id, "Group created");
        Ok(group)
    }

    pub fn set_group_parent(
        &self,
        group_id: &GroupId,
        parent: Option<GroupId>,
    ) -> IdentityResult<()> {
        let mut state = self.write()?;
        if let Some(parent) = &parent {
            if !state.groups.contains_key(parent) {
                return Err(IdentityError::GroupNotFound(parent.clone()));
            }
        }
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| IdentityError::GroupNotFound(group_id.clone()))?;
        group.parent = parent;
        Ok(())
    }

    pub fn add_member(&self, group_id: &GroupId, user_id: &UserId) -> IdentityResult<()> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::UserNotFound(user_id.clone()))?;
        user.groups.insert(group_id.clone());
        match state.groups.get_mut(group_id) {
            Some(group) => {
                group.members.insert(user_id.clone());
                Ok(())
            }
            None => {
                // undo the user-side edit before failing
                if let Some(user) = state.users.get_mut(user_id) {
                    user.groups.remove(group_id);
                }
                Err(IdentityError::GroupNotFound(group_id.clone()))
            }
        }
    }

    /// Returns whether the user was a member
    pub fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> IdentityResult<bool> {
        let mut state = self.write()?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| IdentityError::GroupNotFound(group_id.clone()))?;
        let removed = group.members.remove(user_id);
        if let Some(user) = state.users.get_mut(user_id) {
            user.groups.remove(group_id);
        }
        Ok(removed)
    }

    pub fn assign_group_role(&self, group_id: &GroupId, role_id: &RoleId) -> IdentityResult<()> {
        let mut state = self.write()?;
        if !state.roles.contains_key(role_id) {
            return Err(IdentityError::RoleNotFound(role_id.clone()));
        }
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| IdentityError::GroupNotFound(group_id.clone()))?;
        group.roles.insert(role_id.clone());
        Ok(())
    }

    pub fn revoke_group_role(&self, group_id: &GroupId, role_id: &RoleId) -> IdentityResult<bool> {
        let mut state = self.write()?;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| IdentityError::GroupNotFound(group_id.clone()))?;
        Ok(group.roles.remove(role_id))
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_user(&self, id: &UserId) -> IdentityResult<Option<User>> {
        Ok(self.read()?.users.get(id).cloned())
    }

    async fn get_roles_for_user(&self, id: &UserId) -> IdentityResult<Vec<Role>> {
        let state = self.read()?;
        let Some(user) = state.users.get(id) else {
            return Ok(Vec::new());
        };
        Ok(user
            .roles
            .iter()
            .filter_map(|role_id| state.roles.get(role_id).cloned())
            .collect())
    }

    async fn get_groups_for_user(&self, id: &UserId) -> IdentityResult<Vec<Group>> {
        let state = self.read()?;
        let Some(user) = state.users.get(id) else {
            return Ok(Vec::new());
        };
        Ok(user
            .groups
            .iter()
            .filter_map(|group_id| state.groups.get(group_id).cloned())
            .collect())
    }

    async fn get_role(&self, id: &RoleId) -> IdentityResult<Option<Role>> {
        Ok(self.read()?.roles.get(id).cloned())
    }

    async fn get_role_by_name(&self, name: &RoleName) -> IdentityResult<Option<Role>> {
        Ok(self
            .read()?
            .roles
            .values()
            .find(|role| &role.name == name)
            .cloned())
    }

    async fn get_group(&self, id: &GroupId) -> IdentityResult<Option<Group>> {
        Ok(self.read()?.groups.get(id).cloned())
    }

    async fn list_users(&self) -> IdentityResult<Vec<User>> {
        let mut users: Vec<User> = self.read()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }
}

/// Seed document used to bootstrap an in-memory store.
///
/// Roles are created first, then groups (parents before children), then
/// users with their role and group references.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentitySeed {
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub users: Vec<User>,
}

/// Identity-related errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Role not found: {0}")]
    RoleNotFound(RoleId),

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("User already exists: {0}")]
    DuplicateUser(UserId),

    #[error("Role id already exists: {0}")]
    DuplicateRoleId(RoleId),

    #[error("Role name already in use: {0}")]
    DuplicateRole(RoleName),

    #[error("Group already exists: {0}")]
    DuplicateGroup(GroupId),

    #[error("System role cannot be modified: {0}")]
    SystemRoleImmutable(RoleId),

    #[error("Invalid identity seed: {0}")]
    InvalidSeed(String),

    #[error("Identity backend error: {0}")]
    Backend(String),

    #[error("Lock error")]
    LockError,
}

impl IdentityError {
    /// Whether the error is a missing-record condition
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IdentityError::UserNotFound(_)
                | IdentityError::RoleNotFound(_)
                | IdentityError::GroupNotFound(_)
        )
    }
}
