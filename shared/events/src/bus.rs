use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use wavechat_common::AppError;

use crate::{ClaimOutcome, DomainEvent, EventVersionRegistry, ProcessedEventLedger};

/// A subscriber on the in-process bus. Listeners that touch external state
/// declare `idempotent()` so the bus gates them through the processed-event
/// ledger; `rethrows()` controls whether a failure propagates to the
/// publisher after being recorded (the default is swallow-and-log to keep
/// poison events from looping).
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &'static str;

    fn topics(&self) -> Vec<&'static str>;

    fn idempotent(&self) -> bool {
        false
    }

    fn rethrows(&self) -> bool {
        false
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError>;
}

/// In-process pub/sub with typed topics. Fan-out is synchronous and in
/// emission order; a failing listener never prevents the next one from
/// running.
pub struct EventBus {
    listeners: HashMap<&'static str, Vec<Arc<dyn EventListener>>>,
    registry: Arc<EventVersionRegistry>,
    ledger: Option<ProcessedEventLedger>,
}

pub struct EventBusBuilder {
    listeners: HashMap<&'static str, Vec<Arc<dyn EventListener>>>,
    registry: Arc<EventVersionRegistry>,
    ledger: Option<ProcessedEventLedger>,
}

impl EventBusBuilder {
    pub fn new(registry: Arc<EventVersionRegistry>) -> Self {
        Self {
            listeners: HashMap::new(),
            registry,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: ProcessedEventLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn subscribe(mut self, listener: Arc<dyn EventListener>) -> Self {
        for topic in listener.topics() {
            self.listeners.entry(topic).or_default().push(listener.clone());
        }
        self
    }

    pub fn build(self) -> Arc<EventBus> {
        Arc::new(EventBus {
            listeners: self.listeners,
            registry: self.registry,
            ledger: self.ledger,
        })
    }
}

impl EventBus {
    pub fn registry(&self) -> &EventVersionRegistry {
        &self.registry
    }

    /// Publishes a locally constructed event to every subscriber of its
    /// topic.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), AppError> {
        event.validate()?;

        let Some(listeners) = self.listeners.get(event.event_type()) else {
            tracing::debug!("No listeners for event {}", event.event_type());
            return Ok(());
        };

        for listener in listeners {
            self.dispatch(listener.as_ref(), event).await?;
        }
        Ok(())
    }

    /// Entry point for events that arrived from another process: checks
    /// compatibility, lifts the raw value to the current version of its
    /// type, then fans out as usual.
    pub async fn publish_external(&self, raw: serde_json::Value) -> Result<(), AppError> {
        if !self.registry.compatible(&raw) {
            return Err(AppError::Validation(
                "Incompatible or untyped external event".to_string(),
            ));
        }
        let upgraded = self.registry.upgrade_to_current(raw)?;
        let event: DomainEvent = serde_json::from_value(upgraded)
            .map_err(|e| AppError::Validation(format!("Malformed external event: {}", e)))?;
        self.publish(&event).await
    }

    async fn dispatch(&self, listener: &dyn EventListener, event: &DomainEvent) -> Result<(), AppError> {
        if listener.idempotent() {
            if let Some(ledger) = &self.ledger {
                // Atomic claim: with the same frame fanned out to every
                // replica, exactly one dispatcher wins the pair.
                match ledger.try_claim(event.event_id, listener.name()).await? {
                    ClaimOutcome::AlreadyProcessed => {
                        tracing::debug!(
                            "Skipping {} for {}: already claimed or processed",
                            listener.name(),
                            event.event_id
                        );
                        return Ok(());
                    }
                    ClaimOutcome::Claimed => {}
                }

                return match listener.handle(event).await {
                    Ok(()) => ledger.record_success(event.event_id, listener.name()).await,
                    Err(e) => {
                        tracing::error!(
                            "Listener {} failed on {} ({}): {}",
                            listener.name(),
                            event.event_type(),
                            event.event_id,
                            e
                        );
                        ledger
                            .record_failure(event.event_id, listener.name(), &e.to_string())
                            .await?;
                        if listener.rethrows() {
                            Err(e)
                        } else {
                            Ok(())
                        }
                    }
                };
            }
        }

        match listener.handle(event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    "Listener {} failed on {} ({}): {}",
                    listener.name(),
                    event.event_type(),
                    event.event_id,
                    e
                );
                if listener.rethrows() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{default_registry, EventPayload, EventSource};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventListener for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn topics(&self) -> Vec<&'static str> {
            vec!["user.blocked"]
        }

        async fn handle(&self, _event: &DomainEvent) -> Result<(), AppError> {
            self.log.lock().unwrap().push(self.name.to_string());
            if self.fail {
                Err(AppError::Internal("listener exploded".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn blocked_event() -> DomainEvent {
        DomainEvent::new(
            EventSource::Users,
            "u1",
            EventPayload::UserBlocked {
                blocker_id: Uuid::new_v4(),
                blocked_id: Uuid::new_v4(),
            },
        )
    }

    #[tokio::test]
    async fn fan_out_preserves_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBusBuilder::new(Arc::new(default_registry()))
            .subscribe(Arc::new(Recorder { name: "first", log: log.clone(), fail: false }))
            .subscribe(Arc::new(Recorder { name: "second", log: log.clone(), fail: false }))
            .build();

        bus.publish(&blocked_event()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_listener_does_not_starve_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBusBuilder::new(Arc::new(default_registry()))
            .subscribe(Arc::new(Recorder { name: "boom", log: log.clone(), fail: true }))
            .subscribe(Arc::new(Recorder { name: "after", log: log.clone(), fail: false }))
            .build();

        bus.publish(&blocked_event()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["boom", "after"]);
    }

    #[tokio::test]
    async fn external_publish_upgrades_before_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBusBuilder::new(Arc::new(default_registry()))
            .subscribe(Arc::new(Recorder { name: "sink", log: log.clone(), fail: false }))
            .build();

        let raw = serde_json::json!({
            "eventId": Uuid::new_v4().to_string(),
            "eventType": "user.blocked",
            "version": 1,
            "timestamp": "2026-01-04T10:00:00Z",
            "source": "users",
            "aggregateId": "u1",
            "blockerId": Uuid::new_v4().to_string(),
            "blockedId": Uuid::new_v4().to_string(),
        });

        bus.publish_external(raw).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["sink"]);
    }

    #[tokio::test]
    async fn external_publish_rejects_untyped_payloads() {
        let bus = EventBusBuilder::new(Arc::new(default_registry())).build();
        let err = bus
            .publish_external(serde_json::json!({"version": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }
}
