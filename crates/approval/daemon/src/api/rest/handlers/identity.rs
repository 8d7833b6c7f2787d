//! Identity administration handlers
//!
//! Mutations go straight to the in-memory identity store. The engine
//! resolves approvers live, so changes apply to open steps immediately.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rbac_identity::IdentityStore;
use rbac_types::{Group, GroupId, Permission, Role, RoleId, User, UserId};
use serde::Deserialize;
use std::collections::BTreeSet;

/// New user request
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let mut user = User::new(request.id, request.display_name);
    user.email = request.email;
    user.roles = request.roles;
    user.groups = request.groups;
    let user = state.identity.create_user(user)?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.identity.list_users().await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<User>> {
    let id = UserId::new(id);
    match state.identity.get_user(&id).await? {
        Some(user) => Ok(Json(user)),
        None => Err(ApiError::Identity(rbac_identity::IdentityError::UserNotFound(id))),
    }
}

pub async fn deactivate_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.identity.deactivate_user(&UserId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reactivate_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.identity.reactivate_user(&UserId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn lock_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.identity.set_locked(&UserId::new(id), true)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unlock_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.identity.set_locked(&UserId::new(id), false)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign_role(
    State(state): State<AppState>,
    Path((user_id, role_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .assign_role(&UserId::new(user_id), &RoleId::new(role_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revoke_role(
    State(state): State<AppState>,
    Path((user_id, role_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .revoke_role(&UserId::new(user_id), &RoleId::new(role_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_role(
    State(state): State<AppState>,
    Json(role): Json<Role>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    let role = state.identity.create_role(role)?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// Replacement permission list, `resource:action` strings
#[derive(Debug, Deserialize)]
pub struct RolePermissionsRequest {
    pub permissions: Vec<String>,
}

pub async fn update_role_permissions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RolePermissionsRequest>,
) -> ApiResult<Json<Role>> {
    let permissions = request
        .permissions
        .iter()
        .map(|raw| raw.parse::<Permission>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let role = state
        .identity
        .update_role_permissions(&RoleId::new(id), permissions)?;
    Ok(Json(role))
}

pub async fn delete_role(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.identity.delete_role(&RoleId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(group): Json<Group>,
) -> ApiResult<(StatusCode, Json<Group>)> {
    let group = state.identity.create_group(group)?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// Parent change; `null` detaches the group
#[derive(Debug, Deserialize)]
pub struct GroupParentRequest {
    pub parent: Option<GroupId>,
}

pub async fn set_group_parent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<GroupParentRequest>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .set_group_parent(&GroupId::new(id), request.parent)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_member(
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .add_member(&GroupId::new(group_id), &UserId::new(user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .remove_member(&GroupId::new(group_id), &UserId::new(user_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign_group_role(
    State(state): State<AppState>,
    Path((group_id, role_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .assign_group_role(&GroupId::new(group_id), &RoleId::new(role_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revoke_group_role(
    State(state): State<AppState>,
    Path((group_id, role_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .identity
        .revoke_group_role(&GroupId::new(group_id), &RoleId::new(role_id))?;
    Ok(StatusCode::NO_CONTENT)
}
