use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavechat_common::AppError;

/// Module that produced an event. Doubles as the `source` wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Calls,
    Media,
    Users,
    Friendship,
    Privacy,
}

/// Versioned domain event. Events are value objects: immutable after
/// construction and validated before they cross any edge. `event_id` is the
/// idempotency key everywhere downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub aggregate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Sidecar for fields a newer producer emitted that this build does not
    /// model yet. Populated by version upgrades; empty on locally produced
    /// events.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DomainEvent {
    pub fn new(source: EventSource, aggregate_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            version: payload.current_version(),
            timestamp: Utc::now(),
            source,
            aggregate_id: aggregate_id.into(),
            correlation_id: None,
            payload,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.version == 0 {
            return Err(AppError::Validation("Event version must be >= 1".to_string()));
        }
        if self.aggregate_id.is_empty() {
            return Err(AppError::Validation("Event aggregate id must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Terminal outcome of a finished call, shared by the history record and the
/// `call.ended` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalCallStatus {
    Completed,
    Missed,
    NoAnswer,
    Rejected,
    Cancelled,
}

impl TerminalCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalCallStatus::Completed => "completed",
            TerminalCallStatus::Missed => "missed",
            TerminalCallStatus::NoAnswer => "no-answer",
            TerminalCallStatus::Rejected => "rejected",
            TerminalCallStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "completed" => Ok(TerminalCallStatus::Completed),
            "missed" => Ok(TerminalCallStatus::Missed),
            "no-answer" => Ok(TerminalCallStatus::NoAnswer),
            "rejected" => Ok(TerminalCallStatus::Rejected),
            "cancelled" => Ok(TerminalCallStatus::Cancelled),
            other => Err(AppError::Internal(format!("Unknown terminal call status: {}", other))),
        }
    }

    /// Outcomes that bump the receiver's missed-call badge.
    pub fn is_missed_equivalent(&self) -> bool {
        matches!(
            self,
            TerminalCallStatus::Missed | TerminalCallStatus::NoAnswer | TerminalCallStatus::Cancelled
        )
    }
}

/// One tagged variant per cross-system event. The tag is the topic string
/// used for bus subscription and ledger bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "call.initiated", rename_all = "camelCase")]
    CallInitiated {
        call_id: Uuid,
        call_type: String,
        initiator_id: Uuid,
        receiver_ids: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        provider: String,
    },
    #[serde(rename = "call.ended", rename_all = "camelCase")]
    CallEnded {
        call_id: Uuid,
        call_type: String,
        initiator_id: Uuid,
        receiver_ids: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        status: TerminalCallStatus,
        reason: String,
        provider: String,
        duration_seconds: i64,
    },
    #[serde(rename = "call.push_needed", rename_all = "camelCase")]
    CallPushNeeded {
        call_id: Uuid,
        caller_id: Uuid,
        callee_ids: Vec<Uuid>,
        call_type: String,
        reason: String,
    },
    #[serde(rename = "user.blocked", rename_all = "camelCase")]
    UserBlocked { blocker_id: Uuid, blocked_id: Uuid },
    #[serde(rename = "user.unblocked", rename_all = "camelCase")]
    UserUnblocked { blocker_id: Uuid, blocked_id: Uuid },
    #[serde(rename = "friendship.created", rename_all = "camelCase")]
    FriendshipCreated { user_id: Uuid, friend_id: Uuid },
    #[serde(rename = "friendship.removed", rename_all = "camelCase")]
    FriendshipRemoved { user_id: Uuid, friend_id: Uuid },
    #[serde(rename = "privacy.updated", rename_all = "camelCase")]
    PrivacyUpdated {
        user_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_transport_policy: Option<String>,
    },
    #[serde(rename = "media.uploaded", rename_all = "camelCase")]
    MediaUploaded {
        attachment_id: Uuid,
        uploader_id: Uuid,
        media_type: String,
        size_bytes: i64,
    },
    #[serde(rename = "media.processed", rename_all = "camelCase")]
    MediaProcessed {
        attachment_id: Uuid,
        uploader_id: Uuid,
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cdn_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hls_playlist_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
    },
    #[serde(rename = "media.failed", rename_all = "camelCase")]
    MediaFailed {
        attachment_id: Uuid,
        uploader_id: Uuid,
        error: String,
        retry_count: i32,
    },
    #[serde(rename = "media.deleted", rename_all = "camelCase")]
    MediaDeleted { attachment_id: Uuid, uploader_id: Uuid },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::CallInitiated { .. } => "call.initiated",
            EventPayload::CallEnded { .. } => "call.ended",
            EventPayload::CallPushNeeded { .. } => "call.push_needed",
            EventPayload::UserBlocked { .. } => "user.blocked",
            EventPayload::UserUnblocked { .. } => "user.unblocked",
            EventPayload::FriendshipCreated { .. } => "friendship.created",
            EventPayload::FriendshipRemoved { .. } => "friendship.removed",
            EventPayload::PrivacyUpdated { .. } => "privacy.updated",
            EventPayload::MediaUploaded { .. } => "media.uploaded",
            EventPayload::MediaProcessed { .. } => "media.processed",
            EventPayload::MediaFailed { .. } => "media.failed",
            EventPayload::MediaDeleted { .. } => "media.deleted",
        }
    }

    /// Schema version this build produces for the payload's event type.
    pub fn current_version(&self) -> u32 {
        match self {
            EventPayload::CallEnded { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_tag_and_camel_case_fields() {
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        let call = Uuid::new_v4();
        let event = DomainEvent::new(
            EventSource::Calls,
            call.to_string(),
            EventPayload::CallEnded {
                call_id: call,
                call_type: "voice".to_string(),
                initiator_id: caller,
                receiver_ids: vec![callee],
                conversation_id: None,
                status: TerminalCallStatus::Completed,
                reason: "USER_HANGUP".to_string(),
                provider: "P2P".to_string(),
                duration_seconds: 16,
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "call.ended");
        assert_eq!(json["version"], 2);
        assert_eq!(json["durationSeconds"], 16);
        assert_eq!(json["status"], "completed");
        assert!(json.get("correlationId").is_none());

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.event_type(), "call.ended");
    }

    #[test]
    fn missed_equivalent_covers_exactly_the_badge_statuses() {
        assert!(TerminalCallStatus::Missed.is_missed_equivalent());
        assert!(TerminalCallStatus::NoAnswer.is_missed_equivalent());
        assert!(TerminalCallStatus::Cancelled.is_missed_equivalent());
        assert!(!TerminalCallStatus::Completed.is_missed_equivalent());
        assert!(!TerminalCallStatus::Rejected.is_missed_equivalent());
    }

    #[test]
    fn validation_rejects_zero_version() {
        let mut event = DomainEvent::new(
            EventSource::Users,
            "u",
            EventPayload::UserBlocked {
                blocker_id: Uuid::new_v4(),
                blocked_id: Uuid::new_v4(),
            },
        );
        event.version = 0;
        assert!(event.validate().is_err());
    }
}
