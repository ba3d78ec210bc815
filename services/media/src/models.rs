use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavechat_common::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            other => Err(AppError::Internal(format!("Unknown media type: {}", other))),
        }
    }

    /// Media type inferred from the declared mime. Anything unrecognized is
    /// treated as a document and validated as such.
    pub fn from_mime(mime_type: &str) -> Self {
        let lowered = mime_type.to_ascii_lowercase();
        if lowered.starts_with("image/") {
            MediaType::Image
        } else if lowered.starts_with("video/") {
            MediaType::Video
        } else if lowered.starts_with("audio/") {
            MediaType::Audio
        } else {
            MediaType::Document
        }
    }

    /// Images and videos go through the worker queue; audio and documents
    /// are finished inline on confirm.
    pub fn is_queued(&self) -> bool {
        matches!(self, MediaType::Image | MediaType::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Uploaded,
    Processing,
    Ready,
    Failed,
    Expired,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Uploaded => "uploaded",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "pending" => Ok(ProcessingStatus::Pending),
            "uploaded" => Ok(ProcessingStatus::Uploaded),
            "processing" => Ok(ProcessingStatus::Processing),
            "ready" => Ok(ProcessingStatus::Ready),
            "failed" => Ok(ProcessingStatus::Failed),
            "expired" => Ok(ProcessingStatus::Expired),
            other => Err(AppError::Internal(format!("Unknown processing status: {}", other))),
        }
    }

    /// Status advances monotonically except into the terminal failure
    /// states, which are reachable from any non-terminal state.
    pub fn can_advance_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        match next {
            Failed | Expired => !matches!(self, Ready | Failed | Expired),
            _ => Self::rank(next) > Self::rank(*self) && !matches!(self, Failed | Expired),
        }
    }

    fn rank(status: ProcessingStatus) -> u8 {
        match status {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Uploaded => 1,
            ProcessingStatus::Processing => 2,
            ProcessingStatus::Ready => 3,
            ProcessingStatus::Failed | ProcessingStatus::Expired => 4,
        }
    }
}

/// Durable attachment row. `s3_key_temp` and `s3_key` are mutually
/// exclusive once the validate-and-move step completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub uploader_id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub size_bytes: i64,
    pub s3_key_temp: Option<String>,
    pub s3_key: Option<String>,
    pub cdn_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub optimized_url: Option<String>,
    pub hls_playlist_url: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub retry_count: i32,
    pub message_id: Option<Uuid>,
    /// Conversation the attachment's message belongs to; drives the
    /// completion fan-out to active members.
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MediaAttachment {
    /// The object key processing should read from, wherever the attachment
    /// currently lives.
    pub fn current_key(&self) -> Option<&str> {
        self.s3_key.as_deref().or(self.s3_key_temp.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMessageRequest {
    pub message_id: Uuid,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub attachment_id: Uuid,
    pub upload_id: Uuid,
    pub upload_url: String,
    pub temp_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Queue job payload. Small on purpose: workers re-fetch the row, the job
/// only routes and counts attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaJob {
    pub attachment_id: Uuid,
    pub uploader_id: Uuid,
    pub media_type: MediaType,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: u64,
    pub dead_lettered: u64,
}

/// Per-user progress payload pushed over the progress namespace as
/// `progress:{mediaId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub status: ProcessingStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hls_playlist_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_inference_follows_mime_prefix() {
        assert_eq!(MediaType::from_mime("image/png"), MediaType::Image);
        assert_eq!(MediaType::from_mime("video/mp4"), MediaType::Video);
        assert_eq!(MediaType::from_mime("audio/ogg"), MediaType::Audio);
        assert_eq!(MediaType::from_mime("application/pdf"), MediaType::Document);
        assert_eq!(MediaType::from_mime("TEXT/plain"), MediaType::Document);
    }

    #[test]
    fn queued_types_are_image_and_video() {
        assert!(MediaType::Image.is_queued());
        assert!(MediaType::Video.is_queued());
        assert!(!MediaType::Audio.is_queued());
        assert!(!MediaType::Document.is_queued());
    }

    #[test]
    fn status_advances_monotonically() {
        use ProcessingStatus::*;
        assert!(Pending.can_advance_to(Uploaded));
        assert!(Uploaded.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Ready));
        assert!(!Ready.can_advance_to(Processing));
        assert!(!Processing.can_advance_to(Uploaded));
    }

    #[test]
    fn failure_states_are_reachable_but_terminal() {
        use ProcessingStatus::*;
        assert!(Pending.can_advance_to(Expired));
        assert!(Processing.can_advance_to(Failed));
        assert!(!Ready.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Processing));
        assert!(!Expired.can_advance_to(Ready));
    }

    #[test]
    fn job_payload_round_trips() {
        let job = MediaJob {
            attachment_id: Uuid::new_v4(),
            uploader_id: Uuid::new_v4(),
            media_type: MediaType::Video,
            attempt: 2,
            message_id: None,
        };
        let raw = serde_json::to_string(&job).unwrap();
        let back: MediaJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.attachment_id, job.attachment_id);
        assert_eq!(back.attempt, 2);
        assert_eq!(back.media_type, MediaType::Video);
    }
}
