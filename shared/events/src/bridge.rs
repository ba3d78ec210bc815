use std::sync::Arc;

use futures::StreamExt;
use redis::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavechat_common::{AppError, RedisConfig};

use crate::{DomainEvent, EventBus};

const DOMAIN_EVENT_CHANNEL: &str = "events:domain";

#[derive(Debug, Serialize, Deserialize)]
struct BridgeFrame {
    sender_instance: String,
    event: serde_json::Value,
}

/// Redis pub/sub bridge between processes. Outbound: every locally published
/// cross-system event is mirrored onto `events:domain`. Inbound: frames from
/// other instances are upgraded and fanned out on the local bus. The
/// instance id keeps a process from consuming its own frames.
#[derive(Clone)]
pub struct RemoteEventBridge {
    client: Client,
    instance_id: String,
}

impl RemoteEventBridge {
    pub fn new(config: &RedisConfig, service: &str) -> Result<Self, AppError> {
        let client = Client::open(config.connection_string()).map_err(AppError::Redis)?;
        Ok(Self {
            client,
            instance_id: format!("{}-{}", service, Uuid::new_v4()),
        })
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<(), AppError> {
        let frame = BridgeFrame {
            sender_instance: self.instance_id.clone(),
            event: serde_json::to_value(event)
                .map_err(|e| AppError::Internal(format!("Failed to serialize event: {}", e)))?,
        };
        let payload = serde_json::to_string(&frame)
            .map_err(|e| AppError::Internal(format!("Failed to serialize bridge frame: {}", e)))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;
        let _: () = redis::cmd("PUBLISH")
            .arg(DOMAIN_EVENT_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    /// Spawns the subscriber loop. Malformed or incompatible frames are
    /// logged and dropped; the loop itself only exits on connection loss.
    pub fn spawn_subscriber(&self, bus: Arc<EventBus>) {
        let client = self.client.clone();
        let instance_id = self.instance_id.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::run_subscriber(client, instance_id, bus).await {
                tracing::error!("Domain event subscriber stopped: {}", e);
            }
        });
    }

    async fn run_subscriber(
        client: Client,
        instance_id: String,
        bus: Arc<EventBus>,
    ) -> Result<(), AppError> {
        let conn = client.get_async_connection().await.map_err(AppError::Redis)?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(DOMAIN_EVENT_CHANNEL)
            .await
            .map_err(AppError::Redis)?;

        tracing::info!("Subscribed to {}", DOMAIN_EVENT_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Unreadable bridge frame: {}", e);
                    continue;
                }
            };

            let frame: BridgeFrame = match serde_json::from_str(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Malformed bridge frame: {}", e);
                    continue;
                }
            };

            if frame.sender_instance == instance_id {
                continue;
            }

            if let Err(e) = bus.publish_external(frame.event).await {
                tracing::error!("Failed to apply external event: {}", e);
            }
        }

        Ok(())
    }
}
