use sqlx::PgPool;
use uuid::Uuid;

use wavechat_common::AppError;

/// Outcome of claiming an event for a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the `(event_id, handler)` pair; run the handler.
    Claimed,
    /// Another dispatcher already claimed or finished the pair: skip.
    AlreadyProcessed,
}

/// Persistent "processed event x handler" record. The unique
/// `(event_id, handler)` pair is the idempotency gate for every
/// side-effecting listener; the claim itself is a single atomic upsert so
/// concurrent deliveries across replicas race on the row, not on a read.
#[derive(Clone)]
pub struct ProcessedEventLedger {
    pool: PgPool,
}

impl ProcessedEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-if-absent claim. Exactly one concurrent caller wins the pair.
    /// A `failed` row is reclaimable (a failure never blocks a retry), and a
    /// `pending` row older than the staleness horizon is treated as an
    /// abandoned claim from a crashed dispatcher.
    pub async fn try_claim(&self, event_id: Uuid, handler: &str) -> Result<ClaimOutcome, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, handler, status, error, processed_at)
            VALUES ($1, $2, 'pending', NULL, NOW())
            ON CONFLICT (event_id, handler) DO UPDATE
                SET status = 'pending', error = NULL, processed_at = NOW()
                WHERE processed_events.status = 'failed'
                   OR (processed_events.status = 'pending'
                       AND processed_events.processed_at < NOW() - INTERVAL '5 minutes')
            "#,
        )
        .bind(event_id)
        .bind(handler)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyProcessed)
        }
    }

    pub async fn record_success(&self, event_id: Uuid, handler: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, handler, status, error, processed_at)
            VALUES ($1, $2, 'succeeded', NULL, NOW())
            ON CONFLICT (event_id, handler) DO UPDATE
                SET status = 'succeeded', error = NULL, processed_at = NOW()
            "#,
        )
        .bind(event_id)
        .bind(handler)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn record_failure(
        &self,
        event_id: Uuid,
        handler: &str,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, handler, status, error, processed_at)
            VALUES ($1, $2, 'failed', $3, NOW())
            ON CONFLICT (event_id, handler) DO UPDATE
                SET status = 'failed', error = $3, processed_at = NOW()
            "#,
        )
        .bind(event_id)
        .bind(handler)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
