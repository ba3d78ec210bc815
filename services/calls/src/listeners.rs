use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use wavechat_common::{AppError, CacheKeys, CacheService};
use wavechat_events::{
    DomainEvent, EventListener, EventPayload, EventPublisher, EventSource,
};

use crate::history::CallHistoryService;
use crate::hub::SignalingHub;
use crate::models::EndReason;

/// Reacts to block events from the user domain: maintains the block sets the
/// call policy consults and tears down any live call between the pair.
/// Idempotent: replays are suppressed by the processed-event ledger.
pub struct BlockListener {
    history: CallHistoryService,
    cache: CacheService,
}

impl BlockListener {
    pub fn new(history: CallHistoryService, cache: CacheService) -> Self {
        Self { history, cache }
    }
}

#[async_trait]
impl EventListener for BlockListener {
    fn name(&self) -> &'static str {
        "calls-block"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec!["user.blocked", "user.unblocked"]
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        match &event.payload {
            EventPayload::UserBlocked { blocker_id, blocked_id } => {
                self.cache
                    .set_add(
                        &CacheKeys::block_set(&blocker_id.to_string()),
                        &blocked_id.to_string(),
                    )
                    .await?;

                if let Some(response) = self
                    .history
                    .terminate_between(*blocker_id, *blocked_id)
                    .await?
                {
                    tracing::info!(
                        "Terminated call {} after block between {} and {}",
                        response.call_id,
                        blocker_id,
                        blocked_id
                    );
                }
                Ok(())
            }
            EventPayload::UserUnblocked { blocker_id, blocked_id } => {
                self.cache
                    .set_remove(
                        &CacheKeys::block_set(&blocker_id.to_string()),
                        &blocked_id.to_string(),
                    )
                    .await
            }
            _ => Ok(()),
        }
    }
}

/// Keeps the per-user ICE transport policy cache in sync with the privacy
/// domain. A user without an entry falls back to relay-only.
pub struct PrivacyListener {
    cache: CacheService,
}

impl PrivacyListener {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventListener for PrivacyListener {
    fn name(&self) -> &'static str {
        "calls-privacy"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec!["privacy.updated"]
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        if let EventPayload::PrivacyUpdated {
            user_id,
            ice_transport_policy: Some(policy),
        } = &event.payload
        {
            // 24h refresh horizon; privacy updates re-publish on change.
            self.cache
                .set_string(&CacheKeys::ice_policy(&user_id.to_string()), policy, 24 * 3600)
                .await?;
        }
        Ok(())
    }
}

/// Friendship bookkeeping mirrored into the cache. Policy evaluation itself
/// stays a single predicate elsewhere; this listener only maintains state.
pub struct FriendshipListener {
    cache: CacheService,
}

impl FriendshipListener {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventListener for FriendshipListener {
    fn name(&self) -> &'static str {
        "calls-friendship"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec!["friendship.created", "friendship.removed"]
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        match &event.payload {
            EventPayload::FriendshipCreated { user_id, friend_id } => {
                self.cache
                    .set_add(&friend_set(*user_id), &friend_id.to_string())
                    .await?;
                self.cache
                    .set_add(&friend_set(*friend_id), &user_id.to_string())
                    .await
            }
            EventPayload::FriendshipRemoved { user_id, friend_id } => {
                self.cache
                    .set_remove(&friend_set(*user_id), &friend_id.to_string())
                    .await?;
                self.cache
                    .set_remove(&friend_set(*friend_id), &user_id.to_string())
                    .await
            }
            _ => Ok(()),
        }
    }
}

fn friend_set(user_id: Uuid) -> String {
    format!("friends:{}", user_id)
}

/// Socket-side reaction to `call.ended`: notify the room and drop hub
/// state. Deliberately not ledger-gated; every hub instance must clean its
/// own rooms and timers, and the teardown is naturally idempotent.
pub struct CallTeardownListener {
    hub: Arc<SignalingHub>,
}

impl CallTeardownListener {
    pub fn new(hub: Arc<SignalingHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventListener for CallTeardownListener {
    fn name(&self) -> &'static str {
        "calls-teardown"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec!["call.ended"]
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        let EventPayload::CallEnded {
            call_id,
            status,
            reason,
            provider,
            duration_seconds,
            ..
        } = &event.payload
        else {
            return Ok(());
        };

        self.hub.on_call_ended(
            *call_id,
            *status,
            EndReason::parse(reason)?,
            *duration_seconds,
            provider.as_str() == "SFU",
        );
        Ok(())
    }
}

/// Turns a missed-equivalent `call.ended` into a follow-on
/// `call.push_needed` for the notification service. Emits outward through
/// the bridge only, so no listener cycle is possible in-process.
pub struct MissedCallNotificationListener {
    publisher: EventPublisher,
}

impl MissedCallNotificationListener {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventListener for MissedCallNotificationListener {
    fn name(&self) -> &'static str {
        "calls-missed-notification"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec!["call.ended"]
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), AppError> {
        let EventPayload::CallEnded {
            call_id,
            call_type,
            initiator_id,
            receiver_ids,
            status,
            ..
        } = &event.payload
        else {
            return Ok(());
        };

        if !status.is_missed_equivalent() || receiver_ids.is_empty() {
            return Ok(());
        }

        let follow_on = DomainEvent::new(
            EventSource::Calls,
            call_id.to_string(),
            EventPayload::CallPushNeeded {
                call_id: *call_id,
                caller_id: *initiator_id,
                callee_ids: receiver_ids.clone(),
                call_type: call_type.clone(),
                reason: "MISSED_CALL".to_string(),
            },
        )
        .with_correlation(event.event_id);

        self.publisher.publish(&follow_on).await
    }
}
