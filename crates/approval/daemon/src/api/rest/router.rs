//! API Router configuration

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        // Workflow definitions
        .route(
            "/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route(
            "/workflows/:id",
            get(handlers::get_workflow).put(handlers::update_workflow),
        )
        .route(
            "/workflows/:id/versions",
            get(handlers::list_workflow_versions),
        )
        .route(
            "/workflows/:id/versions/:version",
            get(handlers::get_workflow_version),
        )
        // Instances
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::start_approval),
        )
        .route("/instances/:id", get(handlers::get_instance))
        .route("/instances/:id/audit", get(handlers::instance_audit))
        .route("/instances/:id/cancel", post(handlers::cancel_approval))
        .route(
            "/instances/:id/steps/:step/act",
            post(handlers::act_on_step),
        )
        .route(
            "/instances/:id/steps/:step/delegate",
            post(handlers::delegate_step),
        )
        .route(
            "/instances/:id/steps/:step/escalate",
            post(handlers::escalate_step),
        )
        // Per-user views
        .route("/users/:id/pending", get(handlers::list_pending))
        .route("/users/:id/permissions", get(handlers::get_permissions))
        // Compliance and escalation
        .route("/audit", get(handlers::list_audit))
        .route("/escalations/due", get(handlers::list_due_escalations))
        // Identity administration
        .route(
            "/identity/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route("/identity/users/:id", get(handlers::get_user))
        .route(
            "/identity/users/:id/deactivate",
            post(handlers::deactivate_user),
        )
        .route(
            "/identity/users/:id/reactivate",
            post(handlers::reactivate_user),
        )
        .route("/identity/users/:id/lock", post(handlers::lock_user))
        .route("/identity/users/:id/unlock", post(handlers::unlock_user))
        .route(
            "/identity/users/:id/roles/:role_id",
            put(handlers::assign_role).delete(handlers::revoke_role),
        )
        .route("/identity/roles", post(handlers::create_role))
        .route("/identity/roles/:id", delete(handlers::delete_role))
        .route(
            "/identity/roles/:id/permissions",
            put(handlers::update_role_permissions),
        )
        .route("/identity/groups", post(handlers::create_group))
        .route(
            "/identity/groups/:id/parent",
            put(handlers::set_group_parent),
        )
        .route(
            "/identity/groups/:id/members/:user_id",
            put(handlers::add_member).delete(handlers::remove_member),
        )
        .route(
            "/identity/groups/:id/roles/:role_id",
            put(handlers::assign_group_role).delete(handlers::revoke_group_role),
        );

    // Build router with middleware
    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

    let router = if server.enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_engine::{ApprovalEngine, EngineConfig, NoopNotifier};
    use approval_storage::InMemoryApprovalStorage;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use rbac_identity::InMemoryIdentityStore;
    use rbac_types::{Permission, Role, User};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let identity = Arc::new(InMemoryIdentityStore::new());
        identity
            .create_role(
                Role::new("r-manager", "manager")
                    .with_permission(Permission::new("approvals", "read")),
            )
            .unwrap();
        let mut manager = User::new("u1", "Alice Manager");
        manager.roles.insert("r-manager".into());
        identity.create_user(manager).unwrap();
        identity.create_user(User::new("requester", "Rita Requester")).unwrap();

        let engine = Arc::new(ApprovalEngine::new(
            Arc::new(InMemoryApprovalStorage::new()),
            identity.clone(),
            Arc::new(NoopNotifier),
            EngineConfig::default(),
        ));
        create_router(AppState::new(engine, identity), &ServerConfig::default())
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let router = test_router();
        let (status, body) = call(&router, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_start_and_approve_over_http() {
        let router = test_router();

        let (status, workflow) = call(
            &router,
            Method::POST,
            "/api/v1/workflows",
            Some(json!({
                "actor_id": "u1",
                "name": "Change request",
                "steps": [{ "order": 1, "name": "Manager", "approver_roles": ["manager"] }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(workflow["version"], 1);
        let workflow_id = workflow["id"].as_str().unwrap().to_string();

        let (status, started) = call(
            &router,
            Method::POST,
            "/api/v1/instances",
            Some(json!({
                "workflow_id": workflow_id,
                "record_table": "change_requests",
                "record_id": "CR-7",
                "requested_by": "requester"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(started["eligible_approvers"], json!(["u1"]));
        let instance_id = started["instance_id"].as_str().unwrap().to_string();

        let (status, pending) =
            call(&router, Method::GET, "/api/v1/users/u1/pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);

        // Not an eligible approver
        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/v1/instances/{instance_id}/steps/1/act"),
            Some(json!({ "actor_id": "requester", "decision": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "not_authorized");

        let (status, view) = call(
            &router,
            Method::POST,
            &format!("/api/v1/instances/{instance_id}/steps/1/act"),
            Some(json!({ "actor_id": "u1", "decision": "approve", "comment": "ok" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["instance"]["status"], "approved");
        assert_eq!(view["eligible_approvers"], json!([]));

        let (status, audit) = call(
            &router,
            Method::GET,
            &format!("/api/v1/instances/{instance_id}/audit"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_404() {
        let router = test_router();
        let (status, body) =
            call(&router, Method::GET, "/api/v1/instances/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "instance_not_found");
    }

    #[tokio::test]
    async fn test_half_record_filter_is_rejected() {
        let router = test_router();
        let (status, body) = call(
            &router,
            Method::GET,
            "/api/v1/instances?record_table=change_requests",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_locked_approver_drops_out_of_pending() {
        let router = test_router();
        let (_, workflow) = call(
            &router,
            Method::POST,
            "/api/v1/workflows",
            Some(json!({
                "actor_id": "u1",
                "name": "Access request",
                "steps": [{ "order": 1, "name": "Manager", "approver_roles": ["manager"] }]
            })),
        )
        .await;
        let (status, _) = call(
            &router,
            Method::POST,
            "/api/v1/instances",
            Some(json!({
                "workflow_id": workflow["id"],
                "record_table": "access_requests",
                "record_id": "AR-1",
                "requested_by": "requester"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) =
            call(&router, Method::POST, "/api/v1/identity/users/u1/lock", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, pending) = call(&router, Method::GET, "/api/v1/users/u1/pending", None).await;
        assert_eq!(pending, json!([]));
    }

    #[tokio::test]
    async fn test_identity_admin_round_trip() {
        let router = test_router();
        let (status, _) = call(
            &router,
            Method::POST,
            "/api/v1/identity/users",
            Some(json!({ "id": "u5", "display_name": "Eve", "roles": ["r-manager"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, access) =
            call(&router, Method::GET, "/api/v1/users/u5/permissions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(access["roles"], json!(["manager"]));

        let (status, _) = call(
            &router,
            Method::DELETE,
            "/api/v1/identity/users/u5/roles/r-manager",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/v1/identity/users",
            Some(json!({ "id": "u5", "display_name": "Eve again" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate_user");
    }
}
