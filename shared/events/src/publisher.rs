use std::sync::{Arc, OnceLock};

use wavechat_common::AppError;

use crate::{DomainEvent, EventBus, RemoteEventBridge};

/// Publishing handle shared by services whose listeners are themselves bus
/// subscribers. The bus slot is bound exactly once during startup wiring;
/// publishing before `bind` only reaches the cross-process bridge.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<OnceLock<Arc<EventBus>>>,
    bridge: Option<RemoteEventBridge>,
}

impl EventPublisher {
    pub fn new(bridge: Option<RemoteEventBridge>) -> Self {
        Self {
            bus: Arc::new(OnceLock::new()),
            bridge,
        }
    }

    /// Binds the local bus. Called once after all listeners are registered;
    /// later calls are ignored.
    pub fn bind(&self, bus: Arc<EventBus>) {
        let _ = self.bus.set(bus);
    }

    /// Fans the event out locally and mirrors it to other processes. Bridge
    /// failures are logged, not propagated: remote delivery is at-least-once
    /// via the subscriber's own retry, and local side effects must not be
    /// rolled back for it.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), AppError> {
        if let Some(bus) = self.bus.get() {
            bus.publish(event).await?;
        }
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.publish(event).await {
                tracing::error!(
                    "Failed to bridge event {} ({}): {}",
                    event.event_type(),
                    event.event_id,
                    e
                );
            }
        }
        Ok(())
    }
}
