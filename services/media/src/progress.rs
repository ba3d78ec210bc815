use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use wavechat_common::{AppError, CacheKeys, CacheService};

use crate::models::ProgressEvent;
use crate::AppState;

pub type ProgressSender = mpsc::UnboundedSender<Message>;

// Active-membership horizon; refreshed on every join.
const CONVERSATION_ACTIVE_TTL_SECONDS: usize = 3600;

/// Dedicated socket namespace for media progress. A connection joins its
/// user's room on handshake; completion events additionally fan out to
/// members active in the attachment's conversation.
#[derive(Clone)]
pub struct ProgressNotifier {
    connections: Arc<DashMap<Uuid, Vec<(Uuid, ProgressSender)>>>,
    cache: CacheService,
}

impl ProgressNotifier {
    pub fn new(cache: CacheService) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            cache,
        }
    }

    pub fn register(&self, user_id: Uuid, sender: ProgressSender) -> Uuid {
        let socket_id = Uuid::new_v4();
        self.connections
            .entry(user_id)
            .or_default()
            .push((socket_id, sender));
        socket_id
    }

    pub fn unregister(&self, user_id: Uuid, socket_id: Uuid) {
        if let Some(mut sockets) = self.connections.get_mut(&user_id) {
            sockets.retain(|(id, _)| *id != socket_id);
            if sockets.is_empty() {
                drop(sockets);
                self.connections.remove(&user_id);
            }
        }
    }

    /// Emits `progress:{mediaId}` to one user's room.
    pub fn send_progress(&self, user_id: Uuid, media_id: Uuid, event: &ProgressEvent) {
        let Some(frame) = progress_frame(media_id, event) else {
            return;
        };
        self.send_raw(user_id, &frame);
    }

    /// Marks a user active in a conversation for fan-out purposes. The set
    /// key carries a sliding TTL so stale memberships age out even without a
    /// clean disconnect.
    pub async fn join_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        let key = CacheKeys::conversation_active(&conversation_id.to_string());
        self.cache.set_add(&key, &user_id.to_string()).await?;
        self.cache.expire(&key, CONVERSATION_ACTIVE_TTL_SECONDS).await?;
        Ok(())
    }

    pub async fn leave_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
        self.cache
            .set_remove(
                &CacheKeys::conversation_active(&conversation_id.to_string()),
                &user_id.to_string(),
            )
            .await
    }

    /// Completion fan-out: everyone currently active in the conversation the
    /// attachment's message belongs to also hears about it. `exclude` skips
    /// the uploader, who already received the event in their own room.
    pub async fn send_to_conversation(
        &self,
        conversation_id: Uuid,
        media_id: Uuid,
        event: &ProgressEvent,
        exclude: Option<Uuid>,
    ) -> Result<(), AppError> {
        let members = self
            .cache
            .set_members(&CacheKeys::conversation_active(&conversation_id.to_string()))
            .await?;

        let Some(frame) = progress_frame(media_id, event) else {
            return Ok(());
        };
        for member in members {
            if let Ok(user_id) = Uuid::parse_str(&member) {
                if Some(user_id) != exclude {
                    self.send_raw(user_id, &frame);
                }
            }
        }
        Ok(())
    }

    fn send_raw(&self, user_id: Uuid, frame: &str) {
        let Some(sockets) = self.connections.get(&user_id) else {
            return;
        };
        for (_, sender) in sockets.iter() {
            let _ = sender.send(Message::Text(frame.to_string()));
        }
    }
}

fn progress_frame(media_id: Uuid, event: &ProgressEvent) -> Option<String> {
    let mut value = match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            tracing::error!("Failed to serialize progress event");
            return None;
        }
    };
    value.insert(
        "type".to_string(),
        serde_json::Value::String(format!("progress:{}", media_id)),
    );
    serde_json::to_string(&value).ok()
}

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    token: Option<String>,
    /// Conversation the client currently has open; joining it opts the user
    /// into completion fan-out for attachments posted there.
    conversation_id: Option<Uuid>,
}

pub async fn progress_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ProgressQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, Response> {
    let token = bearer_token(&params, &headers).ok_or_else(|| {
        unauthorized(&AppError::Unauthenticated("Missing bearer token".to_string()))
    })?;

    let claims = state
        .jwt_service
        .validate_token(&token)
        .map_err(|e| unauthorized(&e))?;

    let conversation_id = params.conversation_id;
    Ok(ws.on_upgrade(move |socket| handle_progress_socket(socket, claims, conversation_id, state)))
}

fn bearer_token(params: &ProgressQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = &params.token {
        return Some(token.clone());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn unauthorized(err: &AppError) -> Response {
    axum::http::Response::builder()
        .status(err.status_code())
        .body(axum::body::Body::from(err.to_string()))
        .unwrap_or_default()
}

async fn handle_progress_socket(
    socket: WebSocket,
    claims: wavechat_auth::Claims,
    conversation_id: Option<Uuid>,
    state: AppState,
) {
    let user_id = match claims.user_id() {
        Ok(user_id) => user_id,
        Err(_) => return,
    };

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let socket_id = state.progress.register(user_id, tx);

    if let Some(conversation) = conversation_id {
        if let Err(e) = state.progress.join_conversation(conversation, user_id).await {
            tracing::error!("Failed to join conversation {}: {}", conversation, e);
        }
    }

    tracing::info!("Progress socket open for user {}", user_id);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // The namespace is push-only: inbound frames are drained and ignored
    // until the client closes.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.progress.unregister(user_id, socket_id);
    if let Some(conversation) = conversation_id {
        if let Err(e) = state.progress.leave_conversation(conversation, user_id).await {
            tracing::warn!("Failed to leave conversation {}: {}", conversation, e);
        }
    }
    tracing::debug!("Progress socket closed for user {}", user_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatus;

    #[test]
    fn frame_carries_media_scoped_event_name() {
        let media_id = Uuid::new_v4();
        let event = ProgressEvent {
            status: ProcessingStatus::Ready,
            progress: 100,
            thumbnail_url: Some("https://cdn/x-thumb.jpg".to_string()),
            hls_playlist_url: None,
            cdn_url: Some("https://cdn/x.jpg".to_string()),
            error: None,
            message_id: None,
        };

        let frame = progress_frame(media_id, &event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(parsed["type"], format!("progress:{}", media_id));
        assert_eq!(parsed["status"], "ready");
        assert_eq!(parsed["progress"], 100);
        assert!(parsed.get("error").is_none());
    }
}
