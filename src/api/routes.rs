//! HTTP 接口 - 薄层
//!
//! 只做取参、鉴权头提取和错误码映射，所有逻辑都在编排层之下。
//!
//! - `POST /api/session` 开始答题（Authorization: Bearer <token>）
//! - `POST /api/session/next` 轮询下一条指令
//! - `GET  /api/metrics` 只读指标快照
//! - `GET  /api/admin/sessions` / `DELETE /api/admin/sessions/{id}`
//!   管理接口（x-admin-secret 请求头）

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::RelayError;
use crate::orchestrator::{App, StartQuizRequest};

/// 构建路由
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/session", post(start_session))
        .route("/api/session/next", post(next_command))
        .route("/api/metrics", get(metrics))
        .route("/api/admin/sessions", get(admin_list_sessions))
        .route("/api/admin/sessions/{id}", delete(admin_delete_session))
        .route("/health", get(health))
        .with_state(app)
}

/// 错误 → HTTP 状态码
struct ApiError(RelayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn admin_guard(app: &App, headers: &HeaderMap) -> Result<(), ApiError> {
    let secret = headers
        .get("x-admin-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if app.check_admin_secret(secret) {
        Ok(())
    } else {
        Err(ApiError(RelayError::Unauthorized))
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn start_session(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<StartQuizRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError(RelayError::Unauthorized))?;
    let session_id = app.start_quiz(token, req).await?;
    Ok(Json(json!({"session_id": session_id})))
}

#[derive(Debug, Deserialize)]
struct PollRequest {
    session_id: String,
}

async fn next_command(
    State(app): State<Arc<App>>,
    Json(req): Json<PollRequest>,
) -> Result<Json<crate::models::PollReply>, ApiError> {
    let reply = app.poll(&req.session_id).await?;
    Ok(Json(reply))
}

async fn metrics(State(app): State<Arc<App>>) -> Json<crate::orchestrator::MetricsSnapshot> {
    Json(app.metrics().await)
}

async fn admin_list_sessions(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::models::SessionSummary>>, ApiError> {
    admin_guard(&app, &headers)?;
    Ok(Json(app.admin_list_sessions().await))
}

async fn admin_delete_session(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    admin_guard(&app, &headers)?;
    if app.admin_delete_session(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(RelayError::SessionNotFound { id }))
    }
}
