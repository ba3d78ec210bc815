use async_trait::async_trait;
use sqlx::PgPool;

use wavechat_common::AppError;

use crate::{DomainEvent, EventListener};

/// Durable event log, unique on `event_id`. Upserts are idempotent so
/// redelivered events never produce duplicate rows.
#[derive(Clone)]
pub struct EventLogStore {
    pool: PgPool,
}

impl EventLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, event: &DomainEvent) -> Result<(), AppError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| AppError::Internal(format!("Failed to serialize event: {}", e)))?;
        let source = serde_json::to_value(event.source)
            .map_err(|e| AppError::Internal(format!("Failed to serialize event source: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO event_log (
                event_id, event_type, version, source, aggregate_id,
                correlation_id, payload, occurred_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type())
        .bind(event.version as i32)
        .bind(source.as_str().unwrap_or("unknown"))
        .bind(&event.aggregate_id)
        .bind(event.correlation_id)
        .bind(payload)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}

/// Listener that writes critical events to the durable log. Registration is
/// explicit at startup; the topics below are the events whose loss would
/// break downstream accounting.
pub struct EventLogListener {
    store: EventLogStore,
}

impl EventLogListener {
    pub fn new(store: EventLogStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventListener for EventLogListener {
    fn name(&self) -> &'static str {
        "event-log"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            "call.initiated",
            "call.ended",
            "media.uploaded",
            "media.processed",
            "media.failed",
            "media.deleted",
        ]
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        self.store.append(event).await
    }
}
