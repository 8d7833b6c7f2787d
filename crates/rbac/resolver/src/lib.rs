//! RBAC Resolver
//!
//! Computes a user's effective roles and permissions from direct role
//! assignments plus, when enabled, roles granted to every group the user
//! belongs to transitively. Group parents are not guaranteed acyclic, so
//! ancestry is walked with a visited set and a depth bound.
//!
//! Unknown or deactivated users resolve to nothing. Only identity backend
//! failures surface as errors.

#![deny(unsafe_code)]

mod walk;

pub use walk::walk_group_ancestry;

use rbac_identity::{IdentityResult, IdentityStore};
use rbac_types::{Group, GroupId, Permission, Role, RoleId, RoleName, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Default bound on group ancestry depth
pub const DEFAULT_MAX_GROUP_DEPTH: usize = 32;

/// Resolver settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Include roles inherited through group membership
    pub group_roles_enabled: bool,
    pub max_group_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            group_roles_enabled: true,
            max_group_depth: DEFAULT_MAX_GROUP_DEPTH,
        }
    }
}

/// Everything a user is allowed to do, resolved at one point in time
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAccess {
    pub user_id: Option<UserId>,
    pub roles: BTreeSet<RoleName>,
    pub permissions: BTreeSet<Permission>,
}

impl EffectiveAccess {
    pub fn grants(&self, required: &Permission) -> bool {
        self.permissions.iter().any(|p| p.grants(required))
    }
}

/// Effective-permission resolver over an [`IdentityStore`]
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn IdentityStore>,
    config: ResolverConfig,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn resolve_effective_permissions(
        &self,
        user_id: &UserId,
    ) -> IdentityResult<BTreeSet<Permission>> {
        Ok(self.resolve(user_id).await?.permissions)
    }

    pub async fn resolve_effective_role_names(
        &self,
        user_id: &UserId,
    ) -> IdentityResult<BTreeSet<RoleName>> {
        Ok(self.resolve(user_id).await?.roles)
    }

    /// Check a `resource:action` string. Malformed input never grants.
    pub async fn has_permission(&self, user_id: &UserId, required: &str) -> IdentityResult<bool> {
        match required.parse::<Permission>() {
            Ok(permission) => self.has(user_id, &permission).await,
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "Rejecting malformed permission check");
                Ok(false)
            }
        }
    }

    pub async fn has(&self, user_id: &UserId, required: &Permission) -> IdentityResult<bool> {
        Ok(self.resolve(user_id).await?.grants(required))
    }

    /// Resolve roles and permissions in one pass
    pub async fn resolve(&self, user_id: &UserId) -> IdentityResult<EffectiveAccess> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::debug!(user_id = %user_id, "Unknown user resolves to no access");
            return Ok(EffectiveAccess::default());
        };
        if !user.can_act() {
            tracing::debug!(user_id = %user_id, "Inactive user resolves to no access");
            return Ok(EffectiveAccess {
                user_id: Some(user.id),
                ..Default::default()
            });
        }

        let mut roles: Vec<Role> = self.store.get_roles_for_user(user_id).await?;

        if self.config.group_roles_enabled {
            let inherited = self.group_role_ids(user_id).await?;
            let direct: HashSet<RoleId> = roles.iter().map(|r| r.id.clone()).collect();
            for role_id in inherited.difference(&direct) {
                match self.store.get_role(role_id).await? {
                    Some(role) => roles.push(role),
                    None => {
                        tracing::debug!(role_id = %role_id, "Group references missing role");
                    }
                }
            }
        }

        let mut access = EffectiveAccess {
            user_id: Some(user.id),
            ..Default::default()
        };
        for role in roles {
            access.permissions.extend(role.permissions.iter().cloned());
            access.roles.insert(role.name);
        }

        tracing::debug!(
            user_id = %user_id,
            roles = access.roles.len(),
            permissions = access.permissions.len(),
            "Resolved effective access"
        );
        Ok(access)
    }

    /// Role ids granted by every group the user transitively belongs to
    async fn group_role_ids(&self, user_id: &UserId) -> IdentityResult<HashSet<RoleId>> {
        let direct = self.store.get_groups_for_user(user_id).await?;
        let starts: Vec<GroupId> = direct.iter().map(|g| g.id.clone()).collect();
        let groups = self.load_ancestry(direct).await?;

        let visited = walk_group_ancestry(&starts, self.config.max_group_depth, |id| {
            groups.get(id).and_then(|g| g.parent.clone())
        });

        Ok(visited
            .iter()
            .filter_map(|id| groups.get(id))
            .flat_map(|g| g.roles.iter().cloned())
            .collect())
    }

    /// Fetch the parent chain of each group into a local map.
    ///
    /// Stops on already-loaded ids and after `max_group_depth` rounds, so
    /// cyclic parent links terminate.
    async fn load_ancestry(&self, direct: Vec<Group>) -> IdentityResult<HashMap<GroupId, Group>> {
        let mut loaded: HashMap<GroupId, Group> = HashMap::new();
        let mut frontier: Vec<GroupId> = Vec::new();
        for group in direct {
            if let Some(parent) = &group.parent {
                frontier.push(parent.clone());
            }
            loaded.insert(group.id.clone(), group);
        }

        let mut rounds = 1;
        while !frontier.is_empty() && rounds < self.config.max_group_depth {
            let mut next = Vec::new();
            for id in frontier {
                if loaded.contains_key(&id) {
                    continue;
                }
                if let Some(group) = self.store.get_group(&id).await? {
                    if let Some(parent) = &group.parent {
                        next.push(parent.clone());
                    }
                    loaded.insert(id, group);
                }
            }
            frontier = next;
            rounds += 1;
        }
        Ok(loaded)
    }
}
