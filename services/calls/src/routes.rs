use axum::{routing::get, Json, Router};

use crate::{socket, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ws/calls", get(socket::signaling_handler))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "calls" }))
}
