//! HTTP surface
//!
//! Routes mounted under `/autosnapshot` by the central server. Errors are
//! serialized as a structured body; the status code derives from the error
//! kind.

use crate::manager::PolicyManager;
use crate::policy::EditPolicyParams;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rodent_core::{Error, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// URL prefix this router is mounted under.
pub const ROUTE_PREFIX: &str = "/autosnapshot";

/// Structured error body returned for every failure.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub domain: String,
    pub message: String,
    pub details: Vec<String>,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

/// Error wrapper carrying the HTTP mapping.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            domain: "autosnapshot".to_string(),
            message: self.0.to_string(),
            details: Vec::new(),
            metadata: self.0.metadata(),
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    remove_snapshots: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    #[serde(default)]
    schedule_index: usize,
    #[serde(default)]
    dry_run: bool,
}

/// Build the autosnapshot router.
pub fn create_router(manager: PolicyManager) -> Router {
    Router::new()
        .route("/policies", get(list_policies).post(create_policy))
        .route(
            "/policy/:id",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/policy/:id/run", post(run_policy))
        .route("/monitors", get(list_monitors))
        .route("/status", get(status))
        .with_state(manager)
}

async fn list_policies(State(manager): State<PolicyManager>) -> Response {
    let policies = manager.list_policies().await;
    Json(json!({
        "policies": policies,
        "count": policies.len(),
    }))
    .into_response()
}

async fn create_policy(
    State(manager): State<PolicyManager>,
    Json(params): Json<EditPolicyParams>,
) -> Result<Response, ApiError> {
    let policy = manager.add_policy(params).await?;
    Ok((StatusCode::CREATED, Json(policy)).into_response())
}

async fn get_policy(
    State(manager): State<PolicyManager>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let policy = manager.get_policy(id).await?;
    Ok(Json(policy).into_response())
}

async fn update_policy(
    State(manager): State<PolicyManager>,
    Path(id): Path<Uuid>,
    Json(params): Json<EditPolicyParams>,
) -> Result<Response, ApiError> {
    let policy = manager.update_policy(id, params).await?;
    Ok(Json(policy).into_response())
}

async fn delete_policy(
    State(manager): State<PolicyManager>,
    Path(id): Path<Uuid>,
    Query(query): Query<RemoveQuery>,
) -> Result<Response, ApiError> {
    let outcome = manager.remove_policy(id, query.remove_snapshots).await?;
    let message = if outcome.failed_snapshots.is_empty() {
        format!(
            "policy {} removed ({} snapshots destroyed)",
            id,
            outcome.removed_snapshots.len()
        )
    } else {
        format!(
            "policy {} removed ({} snapshots destroyed, {} failed)",
            id,
            outcome.removed_snapshots.len(),
            outcome.failed_snapshots.len()
        )
    };
    Ok(Json(json!({
        "message": message,
        "removed_snapshots": outcome.removed_snapshots,
        "failed_snapshots": outcome.failed_snapshots,
    }))
    .into_response())
}

async fn run_policy(
    State(manager): State<PolicyManager>,
    Path(id): Path<Uuid>,
    Query(query): Query<RunQuery>,
) -> Result<Response, ApiError> {
    let result = manager
        .run_policy(id, query.schedule_index, query.dry_run)
        .await?;
    Ok(Json(result).into_response())
}

async fn list_monitors(State(manager): State<PolicyManager>) -> Response {
    let monitors = manager.list_monitors().await;
    Json(json!({
        "monitors": monitors,
        "count": monitors.len(),
    }))
    .into_response()
}

async fn status(State(manager): State<PolicyManager>) -> Response {
    Json(manager.status().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ScheduleKind, ScheduleSpec};
    use crate::scheduler::Scheduler;
    use crate::store::ConfigStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rodent_zfs::MemoryGateway;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn test_router() -> (Router, PolicyManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.add_dataset("tank/data");
        let manager = PolicyManager::new(
            ConfigStore::new(dir.path()),
            gateway,
            Scheduler::new(),
        );
        manager.load_config().await.unwrap();
        (create_router(manager.clone()), manager, dir)
    }

    fn params_json() -> String {
        serde_json::to_string(&EditPolicyParams {
            id: None,
            name: "nightly".to_string(),
            description: String::new(),
            dataset: "tank/data".to_string(),
            schedules: vec![ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 })],
            recursive: false,
            snap_name_pattern: String::new(),
            retention_policy: Default::default(),
            properties: Default::default(),
            enabled: true,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let (router, _manager, _dir) = test_router().await;

        let created = router
            .clone()
            .oneshot(
                Request::post("/policies")
                    .header("content-type", "application/json")
                    .body(Body::from(params_json()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let listed = router
            .oneshot(Request::get("/policies").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let bytes = to_bytes(listed.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(value["policies"][0]["name"], "nightly");
    }

    #[tokio::test]
    async fn test_validation_error_shape() {
        let (router, _manager, _dir) = test_router().await;

        let body = serde_json::json!({
            "name": "", "dataset": "tank/data",
            "schedules": [{"kind": "hourly", "interval": 1}],
        });
        let response = router
            .oneshot(
                Request::post("/policies")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["code"], "VALIDATION");
        assert_eq!(value["domain"], "autosnapshot");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_policy_is_404() {
        let (router, _manager, _dir) = test_router().await;
        let response = router
            .oneshot(
                Request::get(format!("/policy/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dry_run_route() {
        let (router, manager, _dir) = test_router().await;
        let policy = {
            let params: EditPolicyParams = serde_json::from_str(&params_json()).unwrap();
            manager.add_policy(params).await.unwrap()
        };

        let response = router
            .oneshot(
                Request::post(format!("/policy/{}/run?dry_run=true", policy.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["dry_run"], true);
        assert!(value["snap_short_name"]
            .as_str()
            .unwrap()
            .starts_with("autosnap-nightly-"));
    }
}
