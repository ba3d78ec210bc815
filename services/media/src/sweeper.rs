use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};

use wavechat_common::AppError;

use crate::attachments::AttachmentStore;
use crate::config::RetentionConfig;
use crate::storage::StorageService;

const PURGE_BATCH: i64 = 100;

/// Retention sweeps: expire pending uploads whose presigned URL lapsed, and
/// physically remove soft-deleted attachments once their grace window is
/// over.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: AttachmentStore,
    storage: StorageService,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: AttachmentStore, storage: StorageService, config: RetentionConfig) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Schedules the sweep and hands the scheduler back to the caller, who
    /// must keep it alive for the lifetime of the service.
    pub async fn start(&self) -> Result<JobScheduler, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create scheduler: {}", e)))?;

        let sweeper = self.clone();
        let job = Job::new_async(self.config.sweep_cron.as_str(), move |_id, _lock| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                if let Err(e) = sweeper.sweep().await {
                    tracing::error!("Retention sweep failed: {}", e);
                }
            })
        })
        .map_err(|e| AppError::Internal(format!("Invalid sweep cron: {}", e)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to schedule sweep: {}", e)))?;
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to start scheduler: {}", e)))?;

        tracing::info!("Retention sweeper scheduled ({})", self.config.sweep_cron);
        Ok(scheduler)
    }

    pub async fn sweep(&self) -> Result<(), AppError> {
        let now = Utc::now();

        let pending_cutoff = now - Duration::hours(self.config.pending_expiry_hours);
        let expired = self.store.expire_stale_pending(pending_cutoff).await?;
        if expired > 0 {
            tracing::info!("Expired {} stale pending uploads", expired);
        }

        let delete_cutoff = now - Duration::hours(self.config.deleted_grace_hours);
        let doomed = self.store.deleted_before(delete_cutoff, PURGE_BATCH).await?;
        for attachment in doomed {
            for key in [attachment.s3_key.as_deref(), attachment.s3_key_temp.as_deref()]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self.storage.delete_object(key).await {
                    tracing::warn!("Failed to delete object {}: {}", key, e);
                }
            }
            self.store.purge(attachment.id).await?;
            tracing::info!("Purged attachment {}", attachment.id);
        }

        Ok(())
    }
}
