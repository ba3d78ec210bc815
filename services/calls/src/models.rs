use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavechat_common::AppError;
use wavechat_events::TerminalCallStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "voice" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            other => Err(AppError::Internal(format!("Unknown call type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallProvider {
    #[serde(rename = "P2P")]
    P2p,
    #[serde(rename = "SFU")]
    Sfu,
}

impl CallProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallProvider::P2p => "P2P",
            CallProvider::Sfu => "SFU",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "P2P" => Ok(CallProvider::P2p),
            "SFU" => Ok(CallProvider::Sfu),
            other => Err(AppError::Internal(format!("Unknown call provider: {}", other))),
        }
    }
}

/// Why a call reached its terminal state. Serialized into history rows and
/// the `call.ended` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    UserHangup,
    Rejected,
    Timeout,
    Cancelled,
    NetworkDrop,
    Blocked,
    CallFailed,
}

impl EndReason {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "USER_HANGUP" => Ok(EndReason::UserHangup),
            "REJECTED" => Ok(EndReason::Rejected),
            "TIMEOUT" => Ok(EndReason::Timeout),
            "CANCELLED" => Ok(EndReason::Cancelled),
            "NETWORK_DROP" => Ok(EndReason::NetworkDrop),
            "BLOCKED" => Ok(EndReason::Blocked),
            "CALL_FAILED" => Ok(EndReason::CallFailed),
            other => Err(AppError::Internal(format!("Unknown end reason: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserHangup => "USER_HANGUP",
            EndReason::Rejected => "REJECTED",
            EndReason::Timeout => "TIMEOUT",
            EndReason::Cancelled => "CANCELLED",
            EndReason::NetworkDrop => "NETWORK_DROP",
            EndReason::Blocked => "BLOCKED",
            EndReason::CallFailed => "CALL_FAILED",
        }
    }
}

/// Live session status as stored in the cache. Terminal calls never appear
/// here: the finalizer destroys the session instead of writing `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ringing,
    Active,
    Reconnecting,
}

/// Ephemeral call session. Lives only in the cache at
/// `call:session:{callId}`; the per-user index `call:user:{id}:current` is
/// the authoritative busy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallSession {
    pub call_id: Uuid,
    pub caller_id: Uuid,
    pub callee_id: Uuid,
    /// Ordered receiver set, primary callee first. Never contains the caller.
    pub participant_ids: Vec<Uuid>,
    pub call_type: CallType,
    pub provider: CallProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfu_room_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl ActiveCallSession {
    pub fn is_group_call(&self) -> bool {
        self.participant_ids.len() > 1
    }

    /// Everyone indexed by this session: caller plus every receiver.
    pub fn all_user_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(1 + self.participant_ids.len());
        ids.push(self.caller_id);
        ids.extend(self.participant_ids.iter().copied());
        ids
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.caller_id == user_id || self.participant_ids.contains(&user_id)
    }

    pub fn is_receiver(&self, user_id: Uuid) -> bool {
        self.participant_ids.contains(&user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Host => "host",
            ParticipantRole::Member => "member",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Joined,
    Missed,
    Rejected,
    Left,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Missed => "missed",
            ParticipantStatus::Rejected => "rejected",
            ParticipantStatus::Left => "left",
        }
    }
}

/// Serialized response of a finalized call. Cached at `call:result:{callId}`
/// so concurrent enders observe identical payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryResponse {
    pub call_id: Uuid,
    pub status: TerminalCallStatus,
    pub reason: EndReason,
    pub duration_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub participant_count: i32,
}

// WebSocket frames

/// Inbound frames. Every call-scoped frame carries the call id as a UUID;
/// SDP blobs and ICE candidates stay opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    Initiate {
        callee_id: Uuid,
        call_type: CallType,
        #[serde(default)]
        conversation_id: Option<Uuid>,
        /// Extra receivers beyond the primary callee (group calls).
        #[serde(default)]
        receiver_ids: Vec<Uuid>,
    },
    #[serde(rename = "call:accept", rename_all = "camelCase")]
    Accept { call_id: Uuid },
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    Reject { call_id: Uuid },
    #[serde(rename = "call:hangup", rename_all = "camelCase")]
    Hangup { call_id: Uuid },
    #[serde(rename = "call:offer", rename_all = "camelCase")]
    Offer { call_id: Uuid, sdp: String },
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    Answer { call_id: Uuid, sdp: String },
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        call_id: Uuid,
        /// Pre-serialized JSON fragment; the hub never parses it.
        candidate: String,
    },
    #[serde(rename = "call:ice-restart", rename_all = "camelCase")]
    IceRestart { call_id: Uuid },
    #[serde(rename = "call:ringing-ack", rename_all = "camelCase")]
    RingingAck { call_id: Uuid },
    #[serde(rename = "call:switch-to-daily", rename_all = "camelCase")]
    SwitchToDaily { call_id: Uuid },
}

/// Outbound frames. The relayed ICE batch is assembled as a raw string in
/// the hub (candidates are joined, not parsed) and bypasses this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    Incoming {
        call_id: Uuid,
        caller_id: Uuid,
        caller_name: String,
        call_type: CallType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_config: Option<IceConfigPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meeting_token: Option<String>,
    },
    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    Accepted {
        call_id: Uuid,
        accepted_by: Uuid,
        ice_config: IceConfigPayload,
    },
    #[serde(rename = "call:ended", rename_all = "camelCase")]
    Ended {
        call_id: Uuid,
        status: TerminalCallStatus,
        reason: EndReason,
        duration_seconds: i64,
    },
    #[serde(rename = "call:participant-joined", rename_all = "camelCase")]
    ParticipantJoined { call_id: Uuid, user_id: Uuid },
    #[serde(rename = "call:participant-left", rename_all = "camelCase")]
    ParticipantLeft { call_id: Uuid, user_id: Uuid },
    #[serde(rename = "call:caller-disconnected", rename_all = "camelCase")]
    CallerDisconnected { call_id: Uuid, user_id: Uuid },
    #[serde(rename = "call:daily-room", rename_all = "camelCase")]
    DailyRoom {
        call_id: Uuid,
        room_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meeting_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meeting_tokens: Option<HashMap<Uuid, String>>,
    },
    #[serde(rename = "call:offer", rename_all = "camelCase")]
    Offer { call_id: Uuid, from: Uuid, sdp: String },
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    Answer { call_id: Uuid, from: Uuid, sdp: String },
    #[serde(rename = "call:ice-restart", rename_all = "camelCase")]
    IceRestart {
        call_id: Uuid,
        from: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_config: Option<IceConfigPayload>,
    },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error { code: String, message: String },
}

// ICE / TURN

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfigPayload {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    pub ttl_seconds: u32,
    pub expires_at: DateTime<Utc>,
}

// SFU control plane

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuRoom {
    pub name: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_use_colon_tags() {
        let raw = serde_json::json!({
            "type": "call:accept",
            "callId": "6e8bc430-9c3a-11d9-9669-0800200c9a66",
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Accept { .. }));
    }

    #[test]
    fn initiate_defaults_optional_fields() {
        let raw = serde_json::json!({
            "type": "call:initiate",
            "calleeId": "6e8bc430-9c3a-11d9-9669-0800200c9a66",
            "callType": "voice",
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Initiate {
                conversation_id,
                receiver_ids,
                call_type,
                ..
            } => {
                assert!(conversation_id.is_none());
                assert!(receiver_ids.is_empty());
                assert_eq!(call_type, CallType::Voice);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn provider_uses_upper_case_wire_names() {
        assert_eq!(serde_json::to_value(CallProvider::Sfu).unwrap(), "SFU");
        assert_eq!(serde_json::to_value(CallProvider::P2p).unwrap(), "P2P");
    }

    #[test]
    fn session_group_flag_follows_receiver_count() {
        let mut session = ActiveCallSession {
            call_id: Uuid::new_v4(),
            caller_id: Uuid::new_v4(),
            callee_id: Uuid::new_v4(),
            participant_ids: vec![Uuid::new_v4()],
            call_type: CallType::Voice,
            provider: CallProvider::P2p,
            conversation_id: None,
            sfu_room_name: None,
            started_at: Utc::now(),
            status: SessionStatus::Ringing,
        };
        assert!(!session.is_group_call());

        session.participant_ids.push(Uuid::new_v4());
        assert!(session.is_group_call());
        assert_eq!(session.all_user_ids().len(), 3);
    }

    #[test]
    fn end_reason_wire_format_is_screaming_snake() {
        assert_eq!(serde_json::to_value(EndReason::NetworkDrop).unwrap(), "NETWORK_DROP");
        assert_eq!(serde_json::to_value(EndReason::UserHangup).unwrap(), "USER_HANGUP");
    }
}
