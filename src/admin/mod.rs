//! Admin HTTP surface: JSON endpoints behind the shared bearer secret.

mod dashboard;
mod groups;
mod keys;
mod logs;

use crate::crypto::CryptoService;
use crate::error::Error;
use crate::infrastructure::Database;
use crate::keypool::{KeyProvider, KeyTaskRunner, TaskService};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use http::header;
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub struct AdminState {
    pub db: Database,
    pub crypto: Arc<dyn CryptoService>,
    pub provider: Arc<KeyProvider>,
    pub tasks: Arc<TaskService>,
    pub runner: KeyTaskRunner,
    pub auth_key: String,
    pub encryption_configured: bool,
}

pub fn router(state: Arc<AdminState>) -> Router {
    let protected = Router::new()
        .route("/api/groups", get(groups::list).post(groups::create))
        .route(
            "/api/groups/:id",
            put(groups::update).delete(groups::delete),
        )
        .route("/api/groups/:id/keys/import", post(keys::import))
        .route("/api/groups/:id/keys/delete", post(keys::delete))
        .route("/api/groups/:id/keys/validate", post(keys::validate))
        .route("/api/tasks/status", get(keys::task_status))
        .route("/api/logs", get(logs::query))
        .route("/api/logs/export", get(logs::export_csv))
        .route("/api/dashboard/stats", get(dashboard::stats))
        .route("/api/dashboard/chart", get(dashboard::chart))
        .route("/api/encryption/status", get(dashboard::encryption_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/api/auth/login", post(login))
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
}

async fn auth_middleware(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if state.auth_key.is_empty() || !bool::from(token.as_bytes().ct_eq(state.auth_key.as_bytes()))
    {
        return Error::FatalAuth("invalid admin credentials".to_string()).into_response();
    }

    next.run(request).await
}

#[derive(Deserialize)]
struct LoginRequest {
    auth_key: String,
}

async fn login(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let valid = !state.auth_key.is_empty()
        && bool::from(body.auth_key.as_bytes().ct_eq(state.auth_key.as_bytes()));

    if valid {
        Json(serde_json::json!({"success": true, "message": "authentication successful"}))
            .into_response()
    } else {
        (
            http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "message": "authentication failed"})),
        )
            .into_response()
    }
}

async fn health() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}
