//! REST surface: diagnostics, task event trails and gated admin actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::admin::{Admin, AdminAction};
use crate::config::HealthThresholds;
use crate::error::AdminError;
use crate::health;
use crate::store::Database;

/// Default number of events returned by the event trail endpoint.
const DEFAULT_EVENT_LIMIT: usize = 200;

/// Shared state for every route.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Database>,
    pub admin: Arc<Admin>,
    pub thresholds: HealthThresholds,
    pub cycle: watch::Receiver<bool>,
    /// Admin routes answer 403 when unset.
    pub admin_token: Option<SecretString>,
}

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/tasks/{id}/unassign", post(unassign))
        .route("/api/tasks/{id}/requeue", post(requeue))
        .route("/api/tasks/{id}/fail", post(force_fail))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ai-orchestrator"
    }))
}

async fn diagnostics(State(state): State<ApiState>) -> Response {
    let cycle_detected = *state.cycle.borrow();
    match health::diagnostics(state.store.as_ref(), &state.thresholds, cycle_detected).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to build diagnostics");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    limit: Option<usize>,
}

async fn task_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<EventQuery>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get_task(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error(StatusCode::NOT_FOUND, format!("Task {id} not found")),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    match state.store.list_events_for_task(id, limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct AdminRequest {
    #[serde(default)]
    reason: String,
}

async fn unassign(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AdminRequest>,
) -> Response {
    admin_action(&state, &headers, AdminAction::Unassign, &id, &body.reason).await
}

async fn requeue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AdminRequest>,
) -> Response {
    admin_action(&state, &headers, AdminAction::Requeue, &id, &body.reason).await
}

async fn force_fail(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AdminRequest>,
) -> Response {
    admin_action(&state, &headers, AdminAction::ForceFail, &id, &body.reason).await
}

async fn admin_action(
    state: &ApiState,
    headers: &HeaderMap,
    action: AdminAction,
    id: &str,
    reason: &str,
) -> Response {
    if let Err(resp) = authorize(state.admin_token.as_ref(), headers) {
        return resp;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.admin.apply(action, id, reason).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            let status = match &e {
                AdminError::NotFound { .. } => StatusCode::NOT_FOUND,
                AdminError::IneligibleStatus { .. } => StatusCode::CONFLICT,
                AdminError::MissingReason { .. } => StatusCode::BAD_REQUEST,
                AdminError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error(status, e.to_string())
        }
    }
}

fn authorize(token: Option<&SecretString>, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = token else {
        return Err(error(StatusCode::FORBIDDEN, "Admin actions are disabled"));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(p) if p == token.expose_secret() => Ok(()),
        _ => Err(error(StatusCode::UNAUTHORIZED, "Missing or invalid bearer token")),
    }
}
