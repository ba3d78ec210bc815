use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use wavechat_common::{AppError, CacheKeys, CacheService, Clock};
use wavechat_events::{DomainEvent, EventPayload, EventPublisher, EventSource, TerminalCallStatus};

use crate::config::CallTimingConfig;
use crate::models::{
    ActiveCallSession, CallHistoryResponse, CallProvider, CallType, EndReason, ParticipantRole,
    ParticipantStatus, SessionStatus,
};
use crate::state_machine::{transition, CallEvent, CallState};

const END_LOCK_POLL_MILLIS: u64 = 100;

/// Session lifecycle and finalization. The cache holds the live session and
/// per-user busy index; the relational store only ever sees finished calls.
/// Finalization is serialized per call by the distributed end lock.
#[derive(Clone)]
pub struct CallHistoryService {
    pool: PgPool,
    cache: CacheService,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    timing: CallTimingConfig,
}

impl CallHistoryService {
    pub fn new(
        pool: PgPool,
        cache: CacheService,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        timing: CallTimingConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            publisher,
            clock,
            timing,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    // Session lifecycle

    /// Starts a call. Receivers are deduplicated and the caller excluded; a
    /// busy caller or receiver fails with conflict before anything is
    /// written. With more than one receiver the provider is forced to SFU.
    pub async fn start_call(
        &self,
        caller_id: Uuid,
        callee_id: Uuid,
        call_type: CallType,
        provider: CallProvider,
        conversation_id: Option<Uuid>,
        extra_receiver_ids: &[Uuid],
    ) -> Result<ActiveCallSession, AppError> {
        if caller_id == callee_id {
            return Err(AppError::BadInput("Cannot call yourself".to_string()));
        }

        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        for id in std::iter::once(callee_id).chain(extra_receiver_ids.iter().copied()) {
            if id != caller_id && seen.insert(id) {
                receivers.push(id);
            }
        }
        if receivers.is_empty() {
            return Err(AppError::BadInput("Call has no receivers".to_string()));
        }

        // The user index is the authoritative busy check; reading it before
        // writing keeps a caller from initiating two calls.
        for user_id in std::iter::once(caller_id).chain(receivers.iter().copied()) {
            if self.current_call_id(user_id).await?.is_some() {
                return Err(AppError::Conflict(format!("User {} is busy", user_id)));
            }
        }

        let provider = if receivers.len() > 1 {
            CallProvider::Sfu
        } else {
            provider
        };

        let session = ActiveCallSession {
            call_id: Uuid::new_v4(),
            caller_id,
            callee_id,
            participant_ids: receivers,
            call_type,
            provider,
            conversation_id,
            sfu_room_name: None,
            started_at: self.clock.now(),
            status: SessionStatus::Ringing,
        };

        self.write_session(&session).await?;
        for user_id in session.all_user_ids() {
            self.cache
                .set_string(
                    &CacheKeys::user_current_call(&user_id.to_string()),
                    &session.call_id.to_string(),
                    self.timing.session_ttl_seconds,
                )
                .await?;
        }

        self.publisher
            .publish(&DomainEvent::new(
                EventSource::Calls,
                session.call_id.to_string(),
                EventPayload::CallInitiated {
                    call_id: session.call_id,
                    call_type: session.call_type.as_str().to_string(),
                    initiator_id: caller_id,
                    receiver_ids: session.participant_ids.clone(),
                    conversation_id,
                    provider: session.provider.as_str().to_string(),
                },
            ))
            .await?;

        tracing::info!(
            "Started {} call {} from {} to {} receiver(s)",
            session.call_type.as_str(),
            session.call_id,
            caller_id,
            session.participant_ids.len()
        );
        Ok(session)
    }

    /// Applies a state-machine event to the live session and refreshes its
    /// TTL. A missing session is a silent no-op; a terminal transition is
    /// rejected here because only the finalizer may end a call.
    pub async fn update_status(
        &self,
        call_id: Uuid,
        event: CallEvent,
    ) -> Result<Option<ActiveCallSession>, AppError> {
        let Some(mut session) = self.get_session(call_id).await? else {
            return Ok(None);
        };

        let next = transition(session_state(&session), event)?;
        let status = match next {
            CallState::Ringing => SessionStatus::Ringing,
            CallState::Active => SessionStatus::Active,
            CallState::Reconnecting => SessionStatus::Reconnecting,
            CallState::Ended | CallState::Idle => {
                return Err(AppError::BadInput(
                    "Terminal transitions go through the finalizer".to_string(),
                ));
            }
        };

        // The answer moment is when billing-relevant time starts; a call that
        // never leaves ringing keeps duration zero.
        if session.status == SessionStatus::Ringing && status == SessionStatus::Active {
            session.started_at = self.clock.now();
        }
        session.status = status;
        self.write_session(&session).await?;
        self.refresh_user_indices(&session).await?;
        Ok(Some(session))
    }

    /// Replaces the media provider, optionally storing the SFU room name.
    pub async fn update_provider(
        &self,
        call_id: Uuid,
        provider: CallProvider,
        sfu_room_name: Option<String>,
    ) -> Result<ActiveCallSession, AppError> {
        let mut session = self
            .get_session(call_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No active session for call {}", call_id)))?;

        session.provider = provider;
        if sfu_room_name.is_some() {
            session.sfu_room_name = sfu_room_name;
        }
        self.write_session(&session).await?;
        self.refresh_user_indices(&session).await?;
        Ok(session)
    }

    /// Extends the session TTL. No effect when the session is gone.
    pub async fn heartbeat(&self, call_id: Uuid) -> Result<(), AppError> {
        let key = CacheKeys::call_session(&call_id.to_string());
        if self.cache.expire(&key, self.timing.session_ttl_seconds).await? {
            if let Some(session) = self.get_session(call_id).await? {
                self.refresh_user_indices(&session).await?;
            }
        }
        Ok(())
    }

    pub async fn get_session(&self, call_id: Uuid) -> Result<Option<ActiveCallSession>, AppError> {
        self.cache
            .get_json(&CacheKeys::call_session(&call_id.to_string()))
            .await
    }

    pub async fn get_session_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ActiveCallSession>, AppError> {
        match self.current_call_id(user_id).await? {
            Some(call_id) => self.get_session(call_id).await,
            None => Ok(None),
        }
    }

    /// Frees a group member for other calls without touching the session's
    /// participant list (history materialization still covers them).
    pub async fn release_user_index(&self, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        self.cache
            .delete_if_equals(
                &CacheKeys::user_current_call(&user_id.to_string()),
                &call_id.to_string(),
            )
            .await?;
        Ok(())
    }

    /// Block handler path: finds the call the two users share, if any, and
    /// tears it down with reason BLOCKED and zero duration.
    pub async fn terminate_between(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> Result<Option<CallHistoryResponse>, AppError> {
        let (a, b) = tokio::join!(self.current_call_id(user_a), self.current_call_id(user_b));
        let (Some(call_a), Some(call_b)) = (a?, b?) else {
            return Ok(None);
        };
        if call_a != call_b {
            return Ok(None);
        }

        let response = self
            .end_call(
                call_a,
                TerminalCallStatus::Cancelled,
                EndReason::Blocked,
                Some(0),
            )
            .await?;
        Ok(Some(response))
    }

    // Finalization

    /// The only path that persists a call. Serialized per call id by
    /// `call:end_lock:{callId}`; losers of the race poll the result cache
    /// and receive the winner's response verbatim.
    pub async fn end_call(
        &self,
        call_id: Uuid,
        status: TerminalCallStatus,
        reason: EndReason,
        forced_duration: Option<i64>,
    ) -> Result<CallHistoryResponse, AppError> {
        if self.get_session(call_id).await?.is_none() {
            return self.finalize_orphan(call_id).await;
        }

        let token = Uuid::new_v4().to_string();
        let lock_key = CacheKeys::end_lock(&call_id.to_string());
        if !self
            .cache
            .set_if_absent(&lock_key, &token, self.timing.end_lock_ttl_millis)
            .await?
        {
            return self.await_result(call_id).await;
        }

        // Re-resolve under the lock: a concurrent ender may have finalized
        // and released between our read and our acquisition.
        let result = match self.get_session(call_id).await? {
            Some(session) => {
                self.finalize_session(&session, status, reason, forced_duration)
                    .await
            }
            None => self.finalize_orphan(call_id).await,
        };

        match &result {
            Ok(response) => {
                if let Err(e) = self
                    .cache
                    .set_json(
                        &CacheKeys::end_result(&call_id.to_string()),
                        response,
                        self.timing.end_result_ttl_seconds,
                    )
                    .await
                {
                    tracing::error!("Failed to cache end result for {}: {}", call_id, e);
                }
            }
            Err(e) => {
                tracing::error!("Finalization of call {} failed: {}", call_id, e);
            }
        }

        // Release only while our token still matches; after TTL expiry the
        // key may belong to a successor.
        if !self.cache.delete_if_equals(&lock_key, &token).await? {
            tracing::warn!("End lock for call {} expired before release", call_id);
        }

        result
    }

    /// Terminal path for timer expiry and disconnects: decides the terminal
    /// status from the session's current state, then finalizes.
    pub async fn end_gracefully(
        &self,
        call_id: Uuid,
        reason: EndReason,
    ) -> Result<Option<CallHistoryResponse>, AppError> {
        let Some(session) = self.get_session(call_id).await? else {
            return Ok(None);
        };

        let duration = self.effective_duration(&session);
        let status = match (session.status, reason) {
            (SessionStatus::Active, _) | (SessionStatus::Reconnecting, _) if duration > 0 => {
                TerminalCallStatus::Completed
            }
            (SessionStatus::Ringing, EndReason::Timeout) => TerminalCallStatus::NoAnswer,
            (SessionStatus::Ringing, _) => TerminalCallStatus::Missed,
            _ => TerminalCallStatus::Cancelled,
        };

        self.end_call(call_id, status, reason, None).await.map(Some)
    }

    /// Gracefully ends every call referenced by a user's index. Used on
    /// logout and full disconnect.
    pub async fn cleanup_user_sessions(&self, user_id: Uuid) -> Result<(), AppError> {
        if let Some(call_id) = self.current_call_id(user_id).await? {
            if let Err(e) = self.end_gracefully(call_id, EndReason::NetworkDrop).await {
                tracing::error!("Failed to clean up call {} for {}: {}", call_id, user_id, e);
            }
        }
        Ok(())
    }

    async fn finalize_session(
        &self,
        session: &ActiveCallSession,
        status: TerminalCallStatus,
        reason: EndReason,
        forced_duration: Option<i64>,
    ) -> Result<CallHistoryResponse, AppError> {
        let ended_at = self.clock.now();
        let duration = forced_duration.unwrap_or_else(|| self.effective_duration(session));
        let duration = duration.clamp(0, self.timing.max_call_duration_seconds);

        let participant_count = 1 + session.participant_ids.len() as i32;

        // History record and every participant row land in one transaction.
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO calls (
                id, initiator_id, participant_count, call_type, provider,
                conversation_id, status, end_reason, duration_seconds,
                started_at, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session.call_id)
        .bind(session.caller_id)
        .bind(participant_count)
        .bind(session.call_type.as_str())
        .bind(session.provider.as_str())
        .bind(session.conversation_id)
        .bind(status.as_str())
        .bind(reason.as_str())
        .bind(duration)
        .bind(session.started_at)
        .bind(ended_at)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let host_status = participant_status(ParticipantRole::Host, status);
        sqlx::query(
            r#"
            INSERT INTO call_participants (call_id, user_id, role, status, joined_at, left_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (call_id, user_id) DO NOTHING
            "#,
        )
        .bind(session.call_id)
        .bind(session.caller_id)
        .bind(ParticipantRole::Host.as_str())
        .bind(host_status.as_str())
        .bind(session.started_at)
        .bind(ended_at)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let member_status = participant_status(ParticipantRole::Member, status);
        for receiver_id in &session.participant_ids {
            let joined_at = if member_status == ParticipantStatus::Joined {
                Some(session.started_at)
            } else {
                None
            };
            sqlx::query(
                r#"
                INSERT INTO call_participants (call_id, user_id, role, status, joined_at, left_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (call_id, user_id) DO NOTHING
                "#,
            )
            .bind(session.call_id)
            .bind(receiver_id)
            .bind(ParticipantRole::Member.as_str())
            .bind(member_status.as_str())
            .bind(joined_at)
            .bind(ended_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        // Session teardown: every index key collected from the session, then
        // the session itself. Index deletes are token-checked so a user who
        // already started another call keeps their new index.
        for user_id in session.all_user_ids() {
            self.release_user_index(user_id, session.call_id).await?;
        }
        self.cache
            .delete(&CacheKeys::call_session(&session.call_id.to_string()))
            .await?;

        if status.is_missed_equivalent() {
            for receiver_id in &session.participant_ids {
                self.cache
                    .delete(&CacheKeys::missed_count(&receiver_id.to_string()))
                    .await?;
            }
        }

        self.publisher
            .publish(&DomainEvent::new(
                EventSource::Calls,
                session.call_id.to_string(),
                EventPayload::CallEnded {
                    call_id: session.call_id,
                    call_type: session.call_type.as_str().to_string(),
                    initiator_id: session.caller_id,
                    receiver_ids: session.participant_ids.clone(),
                    conversation_id: session.conversation_id,
                    status,
                    reason: reason.as_str().to_string(),
                    provider: session.provider.as_str().to_string(),
                    duration_seconds: duration,
                },
            ))
            .await?;

        tracing::info!(
            "Finalized call {} as {} ({}) after {}s",
            session.call_id,
            status.as_str(),
            reason.as_str(),
            duration
        );

        Ok(CallHistoryResponse {
            call_id: session.call_id,
            status,
            reason,
            duration_seconds: duration,
            started_at: session.started_at,
            ended_at,
            participant_count,
        })
    }

    /// Duplicate-end path: waits briefly on the winner's cached result.
    async fn await_result(&self, call_id: Uuid) -> Result<CallHistoryResponse, AppError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.timing.end_lock_wait_millis);
        let result_key = CacheKeys::end_result(&call_id.to_string());

        loop {
            if let Some(response) = self.cache.get_json::<CallHistoryResponse>(&result_key).await? {
                return Ok(response);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Timeout(format!(
                    "Timed out waiting for call {} to finalize",
                    call_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(END_LOCK_POLL_MILLIS)).await;
        }
    }

    /// End requested for a session the cache no longer holds: serve the
    /// already-persisted call if there is one.
    async fn finalize_orphan(&self, call_id: Uuid) -> Result<CallHistoryResponse, AppError> {
        if let Some(response) = self
            .cache
            .get_json::<CallHistoryResponse>(&CacheKeys::end_result(&call_id.to_string()))
            .await?
        {
            return Ok(response);
        }

        let row = sqlx::query(
            r#"
            SELECT id, status, end_reason, duration_seconds, started_at, ended_at,
                   participant_count
            FROM calls WHERE id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let Some(row) = row else {
            return Err(AppError::NotFound(format!("No active session for call {}", call_id)));
        };

        let status: String = row.try_get("status").map_err(AppError::Database)?;
        let reason: String = row.try_get("end_reason").map_err(AppError::Database)?;
        Ok(CallHistoryResponse {
            call_id,
            status: TerminalCallStatus::parse(&status)?,
            reason: EndReason::parse(&reason)?,
            duration_seconds: row.try_get("duration_seconds").map_err(AppError::Database)?,
            started_at: row.try_get("started_at").map_err(AppError::Database)?,
            ended_at: row.try_get("ended_at").map_err(AppError::Database)?,
            participant_count: row.try_get("participant_count").map_err(AppError::Database)?,
        })
    }

    // Missed-call badge

    /// Count of missed participant rows newer than the user's last badge
    /// view. Cached briefly; invalidated on finalization and mark-viewed.
    pub async fn missed_count(&self, user_id: Uuid) -> Result<i64, AppError> {
        let count_key = CacheKeys::missed_count(&user_id.to_string());
        if let Some(cached) = self.cache.get_json::<i64>(&count_key).await? {
            return Ok(cached);
        }

        let viewed_at = self.last_viewed_at(user_id).await?;
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS missed
            FROM call_participants cp
            JOIN calls c ON c.id = cp.call_id
            WHERE cp.user_id = $1
              AND cp.status = 'missed'
              AND c.started_at > $2
              AND c.deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(viewed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let count: i64 = row.try_get("missed").map_err(AppError::Database)?;
        self.cache
            .set_json(&count_key, &count, self.timing.missed_count_ttl_seconds)
            .await?;
        Ok(count)
    }

    pub async fn mark_missed_viewed(&self, user_id: Uuid) -> Result<(), AppError> {
        let now = self.clock.now();
        self.cache
            .set_string(
                &CacheKeys::missed_viewed_at(&user_id.to_string()),
                &now.timestamp().to_string(),
                self.timing.missed_viewed_ttl_seconds,
            )
            .await?;
        self.cache
            .delete(&CacheKeys::missed_count(&user_id.to_string()))
            .await?;
        Ok(())
    }

    async fn last_viewed_at(&self, user_id: Uuid) -> Result<DateTime<Utc>, AppError> {
        let raw = self
            .cache
            .get_string(&CacheKeys::missed_viewed_at(&user_id.to_string()))
            .await?;
        let timestamp = raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        Ok(Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now))
    }

    // Internals

    async fn current_call_id(&self, user_id: Uuid) -> Result<Option<Uuid>, AppError> {
        let raw = self
            .cache
            .get_string(&CacheKeys::user_current_call(&user_id.to_string()))
            .await?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    async fn write_session(&self, session: &ActiveCallSession) -> Result<(), AppError> {
        self.cache
            .set_json(
                &CacheKeys::call_session(&session.call_id.to_string()),
                session,
                self.timing.session_ttl_seconds,
            )
            .await
    }

    async fn refresh_user_indices(&self, session: &ActiveCallSession) -> Result<(), AppError> {
        for user_id in session.all_user_ids() {
            self.cache
                .expire(
                    &CacheKeys::user_current_call(&user_id.to_string()),
                    self.timing.session_ttl_seconds,
                )
                .await?;
        }
        Ok(())
    }

    /// Seconds of active call time. A call that never left ringing has no
    /// duration; for answered calls `started_at` was reset at the answer.
    fn effective_duration(&self, session: &ActiveCallSession) -> i64 {
        match session.status {
            SessionStatus::Ringing => 0,
            SessionStatus::Active | SessionStatus::Reconnecting => {
                (self.clock.now() - session.started_at).num_seconds()
            }
        }
    }
}

fn session_state(session: &ActiveCallSession) -> CallState {
    match session.status {
        SessionStatus::Ringing => CallState::Ringing,
        SessionStatus::Active => CallState::Active,
        SessionStatus::Reconnecting => CallState::Reconnecting,
    }
}

/// Ratified mapping from a call's terminal status to each participant's
/// status. Total over (role, terminal status).
pub fn participant_status(role: ParticipantRole, status: TerminalCallStatus) -> ParticipantStatus {
    match (role, status) {
        (_, TerminalCallStatus::Completed) => ParticipantStatus::Joined,
        (ParticipantRole::Host, TerminalCallStatus::Cancelled) => ParticipantStatus::Left,
        (ParticipantRole::Host, _) => ParticipantStatus::Joined,
        (ParticipantRole::Member, TerminalCallStatus::Rejected) => ParticipantStatus::Rejected,
        (ParticipantRole::Member, _) => ParticipantStatus::Missed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic_per_terminal_status() {
        use ParticipantRole::*;
        use TerminalCallStatus::*;

        assert_eq!(participant_status(Host, Completed), ParticipantStatus::Joined);
        assert_eq!(participant_status(Member, Completed), ParticipantStatus::Joined);

        assert_eq!(participant_status(Member, Rejected), ParticipantStatus::Rejected);
        assert_eq!(participant_status(Host, Rejected), ParticipantStatus::Joined);

        assert_eq!(participant_status(Member, Missed), ParticipantStatus::Missed);
        assert_eq!(participant_status(Member, NoAnswer), ParticipantStatus::Missed);

        assert_eq!(participant_status(Host, Cancelled), ParticipantStatus::Left);
        assert_eq!(participant_status(Member, Cancelled), ParticipantStatus::Missed);
    }

    #[test]
    fn end_reason_round_trips_through_storage_format() {
        for reason in [
            EndReason::UserHangup,
            EndReason::Rejected,
            EndReason::Timeout,
            EndReason::Cancelled,
            EndReason::NetworkDrop,
            EndReason::Blocked,
            EndReason::CallFailed,
        ] {
            assert_eq!(EndReason::parse(reason.as_str()).unwrap(), reason);
        }
    }
}
