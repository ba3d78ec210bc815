use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use wavechat_common::AppError;
use wavechat_events::{DomainEvent, EventPayload, EventPublisher, EventSource};

use crate::attachments::AttachmentStore;
use crate::config::{StorageConfig, UploadLimitsConfig};
use crate::keys::{permanent_key, temp_key};
use crate::models::{
    InitiateUploadRequest, InitiateUploadResponse, MediaAttachment, MediaJob, MediaType,
    ProcessingStatus, ProgressEvent,
};
use crate::progress::ProgressNotifier;
use crate::queue::MediaQueue;
use crate::storage::StorageService;
use crate::validate::{extension_for, validate_file};

const CONFIRM_RETRY_ATTEMPTS: u32 = 5;
const CONFIRM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upload lifecycle: initiate issues a presigned URL against a temp key,
/// confirm verifies the object landed and either finishes inline (audio,
/// documents) or hands off to the worker queue (images, video). Both phases
/// are idempotent.
#[derive(Clone)]
pub struct UploadService {
    store: AttachmentStore,
    storage: StorageService,
    queue: Arc<dyn MediaQueue>,
    progress: ProgressNotifier,
    publisher: EventPublisher,
    limits: UploadLimitsConfig,
    storage_config: StorageConfig,
}

impl UploadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: AttachmentStore,
        storage: StorageService,
        queue: Arc<dyn MediaQueue>,
        progress: ProgressNotifier,
        publisher: EventPublisher,
        limits: UploadLimitsConfig,
        storage_config: StorageConfig,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
            progress,
            publisher,
            limits,
            storage_config,
        }
    }

    pub async fn initiate(
        &self,
        user_id: Uuid,
        request: InitiateUploadRequest,
    ) -> Result<InitiateUploadResponse, AppError> {
        if request.size_bytes <= 0 {
            return Err(AppError::Validation("File size must be positive".to_string()));
        }
        let media_type = MediaType::from_mime(&request.mime_type);
        let limit = self.size_limit(media_type);
        if request.size_bytes > limit {
            return Err(AppError::Validation(format!(
                "{} exceeds the {} byte limit for {} uploads",
                request.size_bytes,
                limit,
                media_type.as_str()
            )));
        }

        let upload_id = Uuid::new_v4();
        let key = temp_key(user_id, upload_id);

        // Presign before touching the database: a failure here leaves no
        // orphan row behind.
        let upload_url = self.storage.presigned_put_url(&key, &request.mime_type).await?;
        let expires_at = Utc::now()
            + chrono::Duration::seconds(self.storage_config.presign_expiry_seconds as i64);

        let attachment = self
            .store
            .create_pending(
                upload_id,
                user_id,
                &request.filename,
                &request.mime_type,
                media_type,
                request.size_bytes,
                &key,
                request.conversation_id,
            )
            .await?;

        tracing::info!(
            "Initiated {} upload {} for user {}",
            media_type.as_str(),
            attachment.id,
            user_id
        );

        Ok(InitiateUploadResponse {
            attachment_id: attachment.id,
            upload_id,
            upload_url,
            temp_key: key,
            expires_at,
        })
    }

    pub async fn confirm(&self, user_id: Uuid, attachment_id: Uuid) -> Result<MediaAttachment, AppError> {
        let attachment = self
            .store
            .fetch(attachment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Attachment {} not found", attachment_id)))?;

        if attachment.uploader_id != user_id {
            return Err(AppError::Forbidden("Not the uploader".to_string()));
        }

        // Idempotency: any non-pending attachment just reports its state.
        if attachment.processing_status != ProcessingStatus::Pending {
            return Ok(attachment);
        }

        let temp = attachment
            .s3_key_temp
            .clone()
            .ok_or_else(|| AppError::Internal(format!("Attachment {} lost its temp key", attachment_id)))?;

        self.verify_object_landed(&temp).await?;
        self.store
            .advance_status(attachment_id, &[ProcessingStatus::Pending], ProcessingStatus::Uploaded)
            .await?;

        self.publisher
            .publish(&DomainEvent::new(
                EventSource::Media,
                attachment.id.to_string(),
                EventPayload::MediaUploaded {
                    attachment_id: attachment.id,
                    uploader_id: attachment.uploader_id,
                    media_type: attachment.media_type.as_str().to_string(),
                    size_bytes: attachment.size_bytes,
                },
            ))
            .await?;

        if attachment.media_type.is_queued() {
            self.enqueue_processing(&attachment).await?;
        } else {
            self.process_inline(&attachment, &temp).await?;
        }

        self.store
            .fetch(attachment_id)
            .await?
            .ok_or_else(|| AppError::Internal("Attachment vanished during confirm".to_string()))
    }

    /// Bounded existence probe. Understands a still-running multipart
    /// upload: that keeps retrying instead of failing fast.
    async fn verify_object_landed(&self, key: &str) -> Result<(), AppError> {
        for attempt in 0..CONFIRM_RETRY_ATTEMPTS {
            if self.storage.object_exists(key).await? {
                return Ok(());
            }
            if self.storage.multipart_in_progress(key).await? {
                tracing::debug!("Multipart upload still in flight for {}", key);
            }
            if attempt + 1 < CONFIRM_RETRY_ATTEMPTS {
                tokio::time::sleep(CONFIRM_RETRY_DELAY).await;
            }
        }
        Err(AppError::Validation(format!("No uploaded object found at {}", key)))
    }

    async fn enqueue_processing(&self, attachment: &MediaAttachment) -> Result<(), AppError> {
        self.store
            .advance_status(
                attachment.id,
                &[ProcessingStatus::Uploaded],
                ProcessingStatus::Processing,
            )
            .await?;

        let job = MediaJob {
            attachment_id: attachment.id,
            uploader_id: attachment.uploader_id,
            media_type: attachment.media_type,
            attempt: 0,
            message_id: attachment.message_id,
        };
        match attachment.media_type {
            MediaType::Image => self.queue.enqueue_image(job).await?,
            MediaType::Video => self.queue.enqueue_video(job).await?,
            _ => self.queue.enqueue_file(job).await?,
        }

        self.progress.send_progress(
            attachment.uploader_id,
            attachment.id,
            &ProgressEvent {
                status: ProcessingStatus::Processing,
                progress: 10,
                thumbnail_url: None,
                hls_playlist_url: None,
                cdn_url: None,
                error: None,
                message_id: attachment.message_id,
            },
        );
        Ok(())
    }

    /// Audio and documents finish on the confirm path: deep-validate, move
    /// to the permanent key, mark ready.
    async fn process_inline(&self, attachment: &MediaAttachment, temp: &str) -> Result<(), AppError> {
        let workdir = tempfile::tempdir()
            .map_err(|e| AppError::Internal(format!("Failed to create temp dir: {}", e)))?;
        let local_path = workdir.path().join("original");

        self.storage.download_to_file(temp, &local_path).await?;
        validate_file(&local_path, attachment.media_type).await?;

        let extension = extension_for(&attachment.original_name, &attachment.mime_type);
        let key = permanent_key(attachment.upload_id, attachment.created_at, &extension);
        self.storage.move_object(temp, &key).await?;
        self.store.adopt_permanent_key(attachment.id, &key).await?;

        let cdn_url = self.storage.public_url(&key);
        self.store
            .mark_ready(attachment.id, Some(&cdn_url), None, None, None)
            .await?;

        let event = ProgressEvent {
            status: ProcessingStatus::Ready,
            progress: 100,
            thumbnail_url: None,
            hls_playlist_url: None,
            cdn_url: Some(cdn_url.clone()),
            error: None,
            message_id: attachment.message_id,
        };
        self.progress.send_progress(attachment.uploader_id, attachment.id, &event);
        if let Some(conversation_id) = attachment.conversation_id {
            if let Err(e) = self
                .progress
                .send_to_conversation(
                    conversation_id,
                    attachment.id,
                    &event,
                    Some(attachment.uploader_id),
                )
                .await
            {
                tracing::warn!(
                    "Conversation fan-out failed for attachment {}: {}",
                    attachment.id,
                    e
                );
            }
        }

        self.publisher
            .publish(&DomainEvent::new(
                EventSource::Media,
                attachment.id.to_string(),
                EventPayload::MediaProcessed {
                    attachment_id: attachment.id,
                    uploader_id: attachment.uploader_id,
                    media_type: attachment.media_type.as_str().to_string(),
                    cdn_url: Some(cdn_url),
                    thumbnail_url: None,
                    hls_playlist_url: None,
                    message_id: attachment.message_id,
                },
            ))
            .await?;
        Ok(())
    }

    /// Soft delete: the row is tombstoned now, objects go with the sweeper
    /// after the grace window.
    pub async fn delete(&self, user_id: Uuid, attachment_id: Uuid) -> Result<(), AppError> {
        let attachment = self
            .store
            .fetch(attachment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Attachment {} not found", attachment_id)))?;

        if attachment.uploader_id != user_id {
            return Err(AppError::Forbidden("Only the uploader may delete".to_string()));
        }
        if attachment.deleted_at.is_some() {
            return Ok(());
        }

        self.store.soft_delete(attachment_id).await?;
        self.publisher
            .publish(&DomainEvent::new(
                EventSource::Media,
                attachment.id.to_string(),
                EventPayload::MediaDeleted {
                    attachment_id: attachment.id,
                    uploader_id: attachment.uploader_id,
                },
            ))
            .await?;
        Ok(())
    }

    /// Binds a confirmed attachment to the message that references it, and
    /// to the message's conversation so completion fan-out can reach its
    /// active members.
    pub async fn link_message(
        &self,
        user_id: Uuid,
        attachment_id: Uuid,
        message_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let attachment = self
            .store
            .fetch(attachment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Attachment {} not found", attachment_id)))?;
        if attachment.uploader_id != user_id {
            return Err(AppError::Forbidden("Not the uploader".to_string()));
        }
        self.store
            .link_message(attachment_id, message_id, conversation_id)
            .await
    }

    fn size_limit(&self, media_type: MediaType) -> i64 {
        match media_type {
            MediaType::Image => self.limits.image_max_bytes,
            MediaType::Video => self.limits.video_max_bytes,
            MediaType::Audio => self.limits.audio_max_bytes,
            MediaType::Document => self.limits.document_max_bytes,
        }
    }
}
