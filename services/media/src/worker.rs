use std::path::Path;
use std::time::Duration;

use wavechat_common::AppError;
use wavechat_events::{DomainEvent, EventPayload, EventPublisher, EventSource};

use crate::attachments::AttachmentStore;
use crate::config::ProcessingConfig;
use crate::keys::{derived_key, permanent_key};
use crate::models::{
    MediaAttachment, MediaJob, MediaType, ProcessingStatus, ProgressEvent,
};
use crate::progress::ProgressNotifier;
use crate::storage::StorageService;
use crate::validate::{extension_for, validate_file};
use crate::{image_ops, video_ops};

/// Shared processing logic behind both queue backends. A worker never lets
/// an error cross the message boundary unrecorded: failures land on the
/// attachment row and in per-user progress before the queue decides on
/// redelivery.
pub struct MediaWorker {
    store: AttachmentStore,
    storage: StorageService,
    progress: ProgressNotifier,
    publisher: EventPublisher,
    config: ProcessingConfig,
}

impl MediaWorker {
    pub fn new(
        store: AttachmentStore,
        storage: StorageService,
        progress: ProgressNotifier,
        publisher: EventPublisher,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            store,
            storage,
            progress,
            publisher,
            config,
        }
    }

    pub async fn process(&self, job: &MediaJob, final_attempt: bool) -> Result<(), AppError> {
        match self.process_inner(job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_failure(job, &e, final_attempt).await;
                Err(e)
            }
        }
    }

    async fn process_inner(&self, job: &MediaJob) -> Result<(), AppError> {
        // Step 1: the row may lag the queue message (read-after-write).
        let attachment = self
            .store
            .fetch_with_retries(
                job.attachment_id,
                self.config.fetch_retry_attempts,
                Duration::from_millis(self.config.fetch_retry_delay_millis),
            )
            .await?;

        if attachment.deleted_at.is_some() {
            tracing::info!("Skipping deleted attachment {}", attachment.id);
            return Ok(());
        }
        if attachment.processing_status == ProcessingStatus::Ready {
            return Ok(());
        }
        // A redelivered job finds the row in `failed` from the previous
        // attempt; reopen it so the ready transition is reachable again.
        if attachment.processing_status == ProcessingStatus::Failed {
            self.store.reopen_for_retry(attachment.id).await?;
        }

        let source_key = attachment
            .current_key()
            .ok_or_else(|| AppError::Internal(format!("Attachment {} has no object key", attachment.id)))?
            .to_string();

        // Scoped working directory; released on every exit path.
        let workdir = tempfile::tempdir()
            .map_err(|e| AppError::Internal(format!("Failed to create temp dir: {}", e)))?;
        let local_path = workdir.path().join("original");

        // Steps 2-3: download once, validate, and promote a temp key to its
        // permanent home before deriving anything from it.
        self.storage.download_to_file(&source_key, &local_path).await?;
        validate_file(&local_path, attachment.media_type).await?;

        let permanent = if attachment.s3_key.is_some() {
            source_key
        } else {
            let extension = extension_for(&attachment.original_name, &attachment.mime_type);
            let key = permanent_key(attachment.upload_id, attachment.created_at, &extension);
            self.storage.move_object(&source_key, &key).await?;
            self.store.adopt_permanent_key(attachment.id, &key).await?;
            key
        };

        // Step 4: per-type derivation.
        let (thumbnail_url, optimized_url, hls_url) = match attachment.media_type {
            MediaType::Image => self.process_image(&attachment, &permanent, &local_path, workdir.path()).await?,
            MediaType::Video => self.process_video(&attachment, &permanent, &local_path, workdir.path()).await?,
            // Audio and documents are normally confirmed inline; a queued
            // one just needs the move above.
            MediaType::Audio | MediaType::Document => (None, None, None),
        };

        // Step 5: persist and announce.
        let cdn_url = self.storage.public_url(&permanent);
        self.store
            .mark_ready(
                attachment.id,
                Some(&cdn_url),
                thumbnail_url.as_deref(),
                optimized_url.as_deref(),
                hls_url.as_deref(),
            )
            .await?;

        let event = ProgressEvent {
            status: ProcessingStatus::Ready,
            progress: 100,
            thumbnail_url: thumbnail_url.clone(),
            hls_playlist_url: hls_url.clone(),
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
                    thumbnail_url,
                    hls_playlist_url: hls_url,
                    message_id: attachment.message_id,
                },
            ))
            .await?;

        tracing::info!("Processed attachment {}", attachment.id);
        Ok(())
    }

    async fn process_image(
        &self,
        attachment: &MediaAttachment,
        permanent: &str,
        local_path: &Path,
        workdir: &Path,
    ) -> Result<(Option<String>, Option<String>, Option<String>), AppError> {
        let input = local_path.to_path_buf();
        let out_dir = workdir.to_path_buf();
        let thumbnail_size = self.config.thumbnail_size;
        let optimized_dimension = self.config.optimized_dimension;

        // Decode/resize off the async runtime.
        let outputs = tokio::task::spawn_blocking(move || {
            image_ops::process_image(&input, &out_dir, thumbnail_size, optimized_dimension)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Image task panicked: {}", e)))??;

        let thumb_key = derived_key(permanent, "thumb", "jpg");
        self.storage
            .upload_file(&thumb_key, &outputs.thumbnail, "image/jpeg")
            .await?;
        let thumbnail_url = Some(self.storage.public_url(&thumb_key));

        let optimized_url = match outputs.optimized {
            Some(path) => {
                let optimized_key = derived_key(permanent, "optimized", "jpg");
                self.storage.upload_file(&optimized_key, &path, "image/jpeg").await?;
                Some(self.storage.public_url(&optimized_key))
            }
            None => None,
        };

        tracing::debug!(
            "Image {} derived at {}x{}",
            attachment.id,
            outputs.width,
            outputs.height
        );
        Ok((thumbnail_url, optimized_url, None))
    }

    async fn process_video(
        &self,
        attachment: &MediaAttachment,
        permanent: &str,
        local_path: &Path,
        workdir: &Path,
    ) -> Result<(Option<String>, Option<String>, Option<String>), AppError> {
        let metadata = video_ops::probe(local_path).await?;

        let thumbnail = video_ops::extract_thumbnail(local_path, workdir, self.config.thumbnail_size).await?;
        let thumb_key = derived_key(permanent, "thumb", "jpg");
        self.storage.upload_file(&thumb_key, &thumbnail, "image/jpeg").await?;
        let thumbnail_url = Some(self.storage.public_url(&thumb_key));

        let hls_url = if video_ops::should_transcode_hls(&self.config, &metadata) {
            let hls_dir = workdir.join("hls");
            tokio::fs::create_dir_all(&hls_dir)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create HLS dir: {}", e)))?;

            let playlist = video_ops::transcode_hls(local_path, &hls_dir).await?;
            let hls_prefix = derived_key(permanent, "hls", "dir");
            let hls_prefix = hls_prefix.trim_end_matches(".dir").to_string();

            let mut entries = tokio::fs::read_dir(&hls_dir)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to list HLS dir: {}", e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AppError::Internal(format!("Failed to walk HLS dir: {}", e)))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let mime = if name.ends_with(".m3u8") {
                    "application/vnd.apple.mpegurl"
                } else {
                    "video/mp2t"
                };
                self.storage
                    .upload_file(&format!("{}/{}", hls_prefix, name), &entry.path(), mime)
                    .await?;
            }

            let playlist_name = playlist.file_name().unwrap_or_default().to_string_lossy();
            Some(self.storage.public_url(&format!("{}/{}", hls_prefix, playlist_name)))
        } else {
            None
        };

        tracing::debug!(
            "Video {} probed: {:.1}s {}x{}",
            attachment.id,
            metadata.duration_seconds,
            metadata.width,
            metadata.height
        );
        Ok((thumbnail_url, None, hls_url))
    }

    async fn record_failure(&self, job: &MediaJob, error: &AppError, final_attempt: bool) {
        let retry_count = match self.store.mark_failed(job.attachment_id, &error.to_string()).await {
            Ok(count) => count,
            Err(db_err) => {
                tracing::error!(
                    "Failed to record failure for {}: {}",
                    job.attachment_id,
                    db_err
                );
                (job.attempt + 1) as i32
            }
        };

        let event = ProgressEvent {
            status: ProcessingStatus::Failed,
            progress: 0,
            thumbnail_url: None,
            hls_playlist_url: None,
            cdn_url: None,
            error: Some(error.to_string()),
            message_id: job.message_id,
        };
        self.progress.send_progress(job.uploader_id, job.attachment_id, &event);

        if final_attempt {
            let publish = self
                .publisher
                .publish(&DomainEvent::new(
                    EventSource::Media,
                    job.attachment_id.to_string(),
                    EventPayload::MediaFailed {
                        attachment_id: job.attachment_id,
                        uploader_id: job.uploader_id,
                        error: error.to_string(),
                        retry_count,
                    },
                ))
                .await;
            if let Err(e) = publish {
                tracing::error!("Failed to publish media.failed for {}: {}", job.attachment_id, e);
            }
        }
    }
}
