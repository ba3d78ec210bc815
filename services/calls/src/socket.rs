use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use wavechat_auth::Claims;
use wavechat_common::{AppError, ErrorFrame};

use crate::models::{ClientMessage, ServerMessage};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalingQuery {
    token: String,
}

pub async fn signaling_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SignalingQuery>,
    State(state): State<AppState>,
) -> Result<Response, Response> {
    // No identity, no socket: reject before the upgrade completes.
    let claims = state
        .jwt_service
        .validate_token(&params.token)
        .map_err(|e| error_response(&e))?;

    Ok(ws.on_upgrade(move |socket| handle_signaling_socket(socket, claims, state)))
}

fn error_response(err: &AppError) -> Response {
    let status = axum::http::StatusCode::from_u16(err.status_code())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_string(&ErrorFrame::from(err)).unwrap_or_default();
    axum::http::Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_default()
}

async fn handle_signaling_socket(socket: WebSocket, claims: Claims, state: AppState) {
    let user_id = match claims.user_id() {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!("Socket with malformed identity: {}", e);
            return;
        }
    };
    let username = claims.username.clone();

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let socket_id = state.hub.register_socket(user_id, username.clone(), tx).await;

    // Writer task: drains the per-socket channel onto the wire.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = dispatch_frame(&state, user_id, &text).await {
                    tracing::debug!("Handler error for {}: {}", username, e);
                    let frame = ErrorFrame::from(&e);
                    state.hub.send_to_user(
                        user_id,
                        &ServerMessage::Error {
                            code: frame.code,
                            message: frame.message,
                        },
                    );
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("Socket closed by {}", username);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Socket error for {}: {}", username, e);
                break;
            }
        }
    }

    state.hub.unregister_socket(user_id, socket_id).await;
}

async fn dispatch_frame(state: &AppState, user_id: Uuid, text: &str) -> Result<(), AppError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| AppError::BadInput(format!("Malformed frame: {}", e)))?;

    let hub: &Arc<_> = &state.hub;
    match message {
        ClientMessage::Initiate {
            callee_id,
            call_type,
            conversation_id,
            receiver_ids,
        } => {
            hub.handle_initiate(user_id, callee_id, call_type, conversation_id, receiver_ids)
                .await
        }
        ClientMessage::Accept { call_id } => hub.handle_accept(user_id, call_id).await,
        ClientMessage::Reject { call_id } => hub.handle_reject(user_id, call_id).await,
        ClientMessage::Hangup { call_id } => hub.handle_hangup(user_id, call_id).await,
        ClientMessage::Offer { call_id, sdp } => hub.handle_offer(user_id, call_id, sdp).await,
        ClientMessage::Answer { call_id, sdp } => hub.handle_answer(user_id, call_id, sdp).await,
        ClientMessage::IceCandidate { call_id, candidate } => {
            hub.handle_ice_candidate(user_id, call_id, candidate).await
        }
        ClientMessage::IceRestart { call_id } => hub.handle_ice_restart(user_id, call_id).await,
        ClientMessage::RingingAck { call_id } => hub.handle_ringing_ack(user_id, call_id).await,
        ClientMessage::SwitchToDaily { call_id } => {
            hub.handle_switch_to_daily(user_id, call_id).await
        }
    }
}
