use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use wavechat_common::AppError;

use crate::models::{MediaAttachment, MediaType, ProcessingStatus};

/// Repository for attachment rows. Status updates carry a WHERE guard so the
/// monotonic-advance invariant holds even under concurrent workers.
#[derive(Clone)]
pub struct AttachmentStore {
    pool: PgPool,
}

impl AttachmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_pending(
        &self,
        upload_id: Uuid,
        uploader_id: Uuid,
        original_name: &str,
        mime_type: &str,
        media_type: MediaType,
        size_bytes: i64,
        temp_key: &str,
        conversation_id: Option<Uuid>,
    ) -> Result<MediaAttachment, AppError> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO media_attachments (
                id, upload_id, uploader_id, original_name, mime_type, media_type,
                size_bytes, s3_key_temp, conversation_id, processing_status,
                retry_count, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(upload_id)
        .bind(uploader_id)
        .bind(original_name)
        .bind(mime_type)
        .bind(media_type.as_str())
        .bind(size_bytes)
        .bind(temp_key)
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        attachment_from_row(&row)
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<MediaAttachment>, AppError> {
        let row = sqlx::query("SELECT * FROM media_attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;
        row.as_ref().map(attachment_from_row).transpose()
    }

    /// Fetch with bounded retries; workers can observe a queue message
    /// before the confirming transaction is visible.
    pub async fn fetch_with_retries(
        &self,
        id: Uuid,
        attempts: u32,
        delay: Duration,
    ) -> Result<MediaAttachment, AppError> {
        for attempt in 0..attempts {
            if let Some(attachment) = self.fetch(id).await? {
                return Ok(attachment);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(AppError::NotFound(format!("Attachment {} not found", id)))
    }

    pub async fn advance_status(
        &self,
        id: Uuid,
        from: &[ProcessingStatus],
        to: ProcessingStatus,
    ) -> Result<bool, AppError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            r#"
            UPDATE media_attachments
            SET processing_status = $2, updated_at = NOW()
            WHERE id = $1 AND processing_status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    /// The atomic key move: assigns the permanent key and clears the temp
    /// key in one statement.
    pub async fn adopt_permanent_key(&self, id: Uuid, s3_key: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE media_attachments
            SET s3_key = $2, s3_key_temp = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(s3_key)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn mark_ready(
        &self,
        id: Uuid,
        cdn_url: Option<&str>,
        thumbnail_url: Option<&str>,
        optimized_url: Option<&str>,
        hls_playlist_url: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE media_attachments
            SET processing_status = 'ready',
                cdn_url = COALESCE($2, cdn_url),
                thumbnail_url = COALESCE($3, thumbnail_url),
                optimized_url = COALESCE($4, optimized_url),
                hls_playlist_url = COALESCE($5, hls_playlist_url),
                processing_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND processing_status NOT IN ('failed', 'expired')
            "#,
        )
        .bind(id)
        .bind(cdn_url)
        .bind(thumbnail_url)
        .bind(optimized_url)
        .bind(hls_playlist_url)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Records a failure and bumps the retry counter; returns the new count.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<i32, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE media_attachments
            SET processing_status = 'failed',
                processing_error = $2,
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;
        row.try_get("retry_count").map_err(AppError::Database)
    }

    /// Re-entry for a retried job: a failed row goes back to processing.
    pub async fn reopen_for_retry(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE media_attachments
            SET processing_status = 'processing', updated_at = NOW()
            WHERE id = $1 AND processing_status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Binds the attachment to its message and, when known, the message's
    /// conversation. The conversation is never cleared by a later link that
    /// omits it.
    pub async fn link_message(
        &self,
        id: Uuid,
        message_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE media_attachments
            SET message_id = $2,
                conversation_id = COALESCE($3, conversation_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE media_attachments SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Soft-deleted rows past the grace window, oldest first. The sweeper
    /// removes their objects and then the rows.
    pub async fn deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MediaAttachment>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM media_attachments
            WHERE deleted_at IS NOT NULL AND deleted_at < $1
            ORDER BY deleted_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn purge(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM media_attachments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Pending uploads whose presigned URL lapsed long ago become `expired`.
    pub async fn expire_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE media_attachments
            SET processing_status = 'expired', updated_at = NOW()
            WHERE processing_status = 'pending' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}

fn attachment_from_row(row: &PgRow) -> Result<MediaAttachment, AppError> {
    let media_type: String = row.try_get("media_type").map_err(AppError::Database)?;
    let status: String = row.try_get("processing_status").map_err(AppError::Database)?;

    Ok(MediaAttachment {
        id: row.try_get("id").map_err(AppError::Database)?,
        upload_id: row.try_get("upload_id").map_err(AppError::Database)?,
        uploader_id: row.try_get("uploader_id").map_err(AppError::Database)?,
        original_name: row.try_get("original_name").map_err(AppError::Database)?,
        mime_type: row.try_get("mime_type").map_err(AppError::Database)?,
        media_type: MediaType::parse(&media_type)?,
        size_bytes: row.try_get("size_bytes").map_err(AppError::Database)?,
        s3_key_temp: row.try_get("s3_key_temp").map_err(AppError::Database)?,
        s3_key: row.try_get("s3_key").map_err(AppError::Database)?,
        cdn_url: row.try_get("cdn_url").map_err(AppError::Database)?,
        thumbnail_url: row.try_get("thumbnail_url").map_err(AppError::Database)?,
        optimized_url: row.try_get("optimized_url").map_err(AppError::Database)?,
        hls_playlist_url: row.try_get("hls_playlist_url").map_err(AppError::Database)?,
        processing_status: ProcessingStatus::parse(&status)?,
        processing_error: row.try_get("processing_error").map_err(AppError::Database)?,
        retry_count: row.try_get("retry_count").map_err(AppError::Database)?,
        message_id: row.try_get("message_id").map_err(AppError::Database)?,
        conversation_id: row.try_get("conversation_id").map_err(AppError::Database)?,
        created_at: row.try_get("created_at").map_err(AppError::Database)?,
        updated_at: row.try_get("updated_at").map_err(AppError::Database)?,
        deleted_at: row.try_get("deleted_at").map_err(AppError::Database)?,
    })
}
