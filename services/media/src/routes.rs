use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;

use wavechat_common::{AppError, ErrorFrame};

use crate::models::{
    InitiateUploadRequest, InitiateUploadResponse, LinkMessageRequest, MediaAttachment,
};
use crate::progress;
use crate::AppState;

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/uploads", post(initiate_upload))
        .route("/uploads/:id/confirm", post(confirm_upload))
        .route("/uploads/:id/message", post(link_upload_message))
        .route("/uploads/:id", delete(delete_upload))
        .route("/ws/progress", get(progress::progress_handler))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "media" }))
}

async fn initiate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateUploadRequest>,
) -> Result<Json<InitiateUploadResponse>, (axum::http::StatusCode, Json<ErrorFrame>)> {
    let user_id = authenticate(&state, &headers).map_err(reject)?;
    let response = state.uploads.initiate(user_id, request).await.map_err(reject)?;
    Ok(Json(response))
}

async fn confirm_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<MediaAttachment>, (axum::http::StatusCode, Json<ErrorFrame>)> {
    let user_id = authenticate(&state, &headers).map_err(reject)?;
    let attachment = state.uploads.confirm(user_id, id).await.map_err(reject)?;
    Ok(Json(attachment))
}

async fn link_upload_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<LinkMessageRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<ErrorFrame>)> {
    let user_id = authenticate(&state, &headers).map_err(reject)?;
    state
        .uploads
        .link_message(user_id, id, request.message_id, request.conversation_id)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "linked": true })))
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<ErrorFrame>)> {
    let user_id = authenticate(&state, &headers).map_err(reject)?;
    state.uploads.delete(user_id, id).await.map_err(reject)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthenticated("Missing bearer token".to_string()))?;

    state.jwt_service.validate_token(token)?.user_id()
}

fn reject(err: AppError) -> (axum::http::StatusCode, Json<ErrorFrame>) {
    let status = axum::http::StatusCode::from_u16(err.status_code())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorFrame::from(&err)))
}
