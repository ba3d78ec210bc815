use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use wavechat_common::AppError;
use wavechat_events::{DomainEvent, EventPayload, EventSource, TerminalCallStatus};

use crate::config::CallTimingConfig;
use crate::history::CallHistoryService;
use crate::ice::IceConfigService;
use crate::models::{
    ActiveCallSession, CallProvider, CallType, EndReason, ServerMessage, SessionStatus,
};
use crate::policy::CallPolicy;
use crate::sfu::SfuClient;
use crate::state_machine::CallEvent;

pub type SocketSender = mpsc::UnboundedSender<Message>;

#[derive(Clone)]
pub struct SocketHandle {
    pub socket_id: Uuid,
    pub username: String,
    pub sender: SocketSender,
}

/// WebSocket gateway for call signaling. Owns every per-call timer (ringing,
/// ringing-ack, disconnect grace, ICE batch) indexed by call id; all of them
/// are cancelled deterministically on terminal transitions and reconnect.
/// Handlers are cooperative: they suspend at I/O points and never do CPU
/// work on the socket loop.
pub struct SignalingHub {
    history: CallHistoryService,
    sfu: SfuClient,
    ice: IceConfigService,
    policy: Arc<dyn CallPolicy>,
    timing: CallTimingConfig,

    // user id -> open sockets
    connections: DashMap<Uuid, Vec<SocketHandle>>,
    // call id -> users joined to room `call:{callId}`
    rooms: DashMap<Uuid, Vec<Uuid>>,
    ringing_timers: DashMap<Uuid, JoinHandle<()>>,
    ack_timers: DashMap<Uuid, JoinHandle<()>>,
    grace_timers: DashMap<(Uuid, Uuid), JoinHandle<()>>,
    // (call id, sender) -> buffered ICE candidate fragments
    ice_batches: DashMap<(Uuid, Uuid), Vec<String>>,
}

impl SignalingHub {
    pub fn new(
        history: CallHistoryService,
        sfu: SfuClient,
        ice: IceConfigService,
        policy: Arc<dyn CallPolicy>,
        timing: CallTimingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            history,
            sfu,
            ice,
            policy,
            timing,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            ringing_timers: DashMap::new(),
            ack_timers: DashMap::new(),
            grace_timers: DashMap::new(),
            ice_batches: DashMap::new(),
        })
    }

    // Connection registry

    pub async fn register_socket(
        self: &Arc<Self>,
        user_id: Uuid,
        username: String,
        sender: SocketSender,
    ) -> Uuid {
        let socket_id = Uuid::new_v4();
        self.connections
            .entry(user_id)
            .or_default()
            .push(SocketHandle {
                socket_id,
                username: username.clone(),
                sender,
            });

        tracing::info!("User {} connected ({})", username, socket_id);
        self.handle_reconnect(user_id).await;
        socket_id
    }

    pub async fn unregister_socket(self: &Arc<Self>, user_id: Uuid, socket_id: Uuid) {
        let mut last_socket = false;
        if let Some(mut handles) = self.connections.get_mut(&user_id) {
            handles.retain(|h| h.socket_id != socket_id);
            last_socket = handles.is_empty();
        }
        if last_socket {
            self.connections.remove(&user_id);
            self.handle_full_disconnect(user_id).await;
        }
        tracing::debug!("Socket {} closed for user {}", socket_id, user_id);
    }

    /// A user's last socket went away while a call was live: give them the
    /// grace window before the call is torn down.
    async fn handle_full_disconnect(self: &Arc<Self>, user_id: Uuid) {
        let session = match self.history.get_session_by_user(user_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Disconnect lookup failed for {}: {}", user_id, e);
                return;
            }
        };

        let call_id = session.call_id;
        if session.status == SessionStatus::Active {
            if let Err(e) = self.history.update_status(call_id, CallEvent::Disconnect).await {
                tracing::error!("Failed to mark call {} reconnecting: {}", call_id, e);
            }
            self.broadcast_to_room(
                call_id,
                &ServerMessage::CallerDisconnected { call_id, user_id },
                Some(user_id),
            );
        }

        let hub = self.clone();
        let grace = Duration::from_secs(self.timing.disconnect_grace_seconds);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.grace_timers.remove(&(call_id, user_id));
            hub.grace_expired(call_id).await;
        });

        if let Some(old) = self.grace_timers.insert((call_id, user_id), handle) {
            old.abort();
        }
    }

    /// A socket came back. If a grace timer was pending for this user,
    /// cancel it, rejoin the room and restore state.
    async fn handle_reconnect(self: &Arc<Self>, user_id: Uuid) {
        let pending: Vec<(Uuid, Uuid)> = self
            .grace_timers
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| *entry.key())
            .collect();

        for key in pending {
            if let Some((_, handle)) = self.grace_timers.remove(&key) {
                handle.abort();
            }
            let call_id = key.0;

            let session = match self.history.get_session(call_id).await {
                Ok(Some(session)) => session,
                _ => continue,
            };

            self.join_room(call_id, user_id);
            if let Err(e) = self.history.heartbeat(call_id).await {
                tracing::error!("Heartbeat on reconnect failed for {}: {}", call_id, e);
            }

            match session.status {
                SessionStatus::Reconnecting => {
                    if let Err(e) = self.history.update_status(call_id, CallEvent::Reconnect).await {
                        tracing::error!("Reconnect transition failed for {}: {}", call_id, e);
                    }
                }
                SessionStatus::Ringing if session.is_receiver(user_id) => {
                    // The callee missed the first offer; repeat it with
                    // fresh credentials for whichever provider the call is
                    // on.
                    self.resend_incoming(&session, user_id).await;
                }
                _ => {}
            }
        }
    }

    async fn resend_incoming(self: &Arc<Self>, session: &ActiveCallSession, user_id: Uuid) {
        let (ice_config, room_url, meeting_token) = if session.provider == CallProvider::Sfu {
            let Some(room_name) = session.sfu_room_name.as_deref() else {
                return;
            };
            let token = self
                .sfu
                .create_meeting_token(room_name, user_id, &self.display_name(user_id), false)
                .await
                .ok();
            (None, Some(self.sfu.room_url(room_name)), token)
        } else {
            match self.ice.ice_config(user_id).await {
                Ok(config) => (Some(config), None, None),
                Err(e) => {
                    tracing::error!("Failed to mint ICE config for {}: {}", user_id, e);
                    return;
                }
            }
        };

        self.send_to_user(
            user_id,
            &ServerMessage::Incoming {
                call_id: session.call_id,
                caller_id: session.caller_id,
                caller_name: self.display_name(session.caller_id),
                call_type: session.call_type,
                conversation_id: session.conversation_id,
                ice_config,
                room_url,
                meeting_token,
            },
        );
    }

    async fn grace_expired(self: &Arc<Self>, call_id: Uuid) {
        if let Err(e) = self.history.end_gracefully(call_id, EndReason::NetworkDrop).await {
            tracing::error!("Grace expiry finalization failed for {}: {}", call_id, e);
        }
    }

    // Inbound handlers

    pub async fn handle_initiate(
        self: &Arc<Self>,
        user_id: Uuid,
        callee_id: Uuid,
        call_type: CallType,
        conversation_id: Option<Uuid>,
        receiver_ids: Vec<Uuid>,
    ) -> Result<(), AppError> {
        let is_group = !receiver_ids.is_empty();

        // Group conversations carry their own membership policy; everything
        // else runs the per-receiver predicate.
        if !(is_group && conversation_id.is_some()) {
            for receiver in std::iter::once(callee_id).chain(receiver_ids.iter().copied()) {
                if receiver == user_id {
                    continue;
                }
                if !self.policy.may_call(user_id, receiver).await? {
                    return Err(AppError::Forbidden(format!(
                        "Calling user {} is not permitted",
                        receiver
                    )));
                }
            }
        }

        let session = self
            .history
            .start_call(
                user_id,
                callee_id,
                call_type,
                CallProvider::P2p,
                conversation_id,
                &receiver_ids,
            )
            .await?;

        self.join_room(session.call_id, user_id);
        self.start_ringing_timer(session.call_id);

        if session.is_group_call() {
            self.initiate_group(&session, user_id).await
        } else {
            self.initiate_one_to_one(&session, user_id).await
        }
    }

    async fn initiate_one_to_one(
        self: &Arc<Self>,
        session: &ActiveCallSession,
        caller_id: Uuid,
    ) -> Result<(), AppError> {
        let call_id = session.call_id;
        let callee_id = session.callee_id;
        self.start_ack_timer(call_id);

        if self.is_online(callee_id) {
            self.join_room(call_id, callee_id);
            let ice_config = self.ice.ice_config(callee_id).await?;
            self.send_to_user(
                callee_id,
                &ServerMessage::Incoming {
                    call_id,
                    caller_id,
                    caller_name: self.display_name(caller_id),
                    call_type: session.call_type,
                    conversation_id: session.conversation_id,
                    ice_config: Some(ice_config),
                    room_url: None,
                    meeting_token: None,
                },
            );
        } else {
            self.emit_push_needed(session, vec![callee_id], "CALLEE_OFFLINE").await;
        }
        Ok(())
    }

    async fn initiate_group(
        self: &Arc<Self>,
        session: &ActiveCallSession,
        caller_id: Uuid,
    ) -> Result<(), AppError> {
        let call_id = session.call_id;
        let party_size = 1 + session.participant_ids.len();

        let room = match self.sfu.create_room(call_id, party_size).await {
            Ok(room) => room,
            Err(e) => {
                // The session exists but the control plane is down: tear the
                // call down instead of leaving everyone busy.
                if let Err(end_err) = self
                    .history
                    .end_call(call_id, TerminalCallStatus::Cancelled, EndReason::CallFailed, Some(0))
                    .await
                {
                    tracing::error!("Failed to unwind call {} after SFU error: {}", call_id, end_err);
                }
                self.teardown(call_id, None);
                return Err(e);
            }
        };

        let mut tokens: HashMap<Uuid, String> = HashMap::new();
        for participant in session.all_user_ids() {
            let token = self
                .sfu
                .create_meeting_token(
                    &room.name,
                    participant,
                    &self.display_name(participant),
                    participant == caller_id,
                )
                .await?;
            tokens.insert(participant, token);
        }

        let session = self
            .history
            .update_provider(call_id, CallProvider::Sfu, Some(room.name.clone()))
            .await?;

        let mut offline = Vec::new();
        for receiver in &session.participant_ids {
            if self.is_online(*receiver) {
                self.join_room(call_id, *receiver);
                self.send_to_user(
                    *receiver,
                    &ServerMessage::Incoming {
                        call_id,
                        caller_id,
                        caller_name: self.display_name(caller_id),
                        call_type: session.call_type,
                        conversation_id: session.conversation_id,
                        ice_config: None,
                        room_url: Some(room.url.clone()),
                        meeting_token: tokens.get(receiver).cloned(),
                    },
                );
            } else {
                offline.push(*receiver);
            }
        }
        if !offline.is_empty() {
            self.emit_push_needed(&session, offline, "CALLEE_OFFLINE").await;
        }

        self.send_to_user(
            caller_id,
            &ServerMessage::DailyRoom {
                call_id,
                room_url: room.url,
                meeting_token: None,
                meeting_tokens: Some(tokens),
            },
        );
        Ok(())
    }

    pub async fn handle_accept(self: &Arc<Self>, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_receiver(user_id) {
            return Err(AppError::Forbidden("Only a receiver may accept".to_string()));
        }

        // The first accept answers the call; later group joiners enter an
        // already-active session without a state transition.
        match session.status {
            SessionStatus::Ringing => {
                self.history.update_status(call_id, CallEvent::Accept).await?;
                self.clear_ack_timer(call_id);
                if !session.is_group_call() {
                    self.clear_ringing_timer(call_id);
                }
            }
            _ if session.is_group_call() => {
                self.history.heartbeat(call_id).await?;
            }
            _ => return Err(AppError::BadInput("Call is not ringing".to_string())),
        }
        self.join_room(call_id, user_id);

        if session.is_group_call() {
            self.broadcast_to_room(
                call_id,
                &ServerMessage::ParticipantJoined { call_id, user_id },
                None,
            );
        } else {
            let ice_config = self.ice.ice_config(session.caller_id).await?;
            self.send_to_user(
                session.caller_id,
                &ServerMessage::Accepted {
                    call_id,
                    accepted_by: user_id,
                    ice_config,
                },
            );
        }
        Ok(())
    }

    pub async fn handle_reject(self: &Arc<Self>, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_receiver(user_id) {
            return Err(AppError::Forbidden("Only a receiver may reject".to_string()));
        }

        if session.is_group_call() {
            self.leave_group(&session, user_id).await;
            return Ok(());
        }

        self.history
            .end_call(call_id, TerminalCallStatus::Rejected, EndReason::Rejected, None)
            .await?;
        Ok(())
    }

    pub async fn handle_hangup(self: &Arc<Self>, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }

        // Caller abandoning a ringing call is a cancel, a group member
        // hanging up is a leave, everything else finalizes the call.
        if session.status == SessionStatus::Ringing && user_id == session.caller_id {
            self.history
                .end_call(call_id, TerminalCallStatus::Cancelled, EndReason::Cancelled, None)
                .await?;
            return Ok(());
        }

        if session.is_group_call() && user_id != session.caller_id {
            self.leave_group(&session, user_id).await;
            return Ok(());
        }

        self.history.end_gracefully(call_id, EndReason::UserHangup).await?;
        Ok(())
    }

    pub async fn handle_offer(
        self: &Arc<Self>,
        user_id: Uuid,
        call_id: Uuid,
        sdp: String,
    ) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }
        // Opaque relay; the hub never inspects SDP.
        self.broadcast_to_room(
            call_id,
            &ServerMessage::Offer { call_id, from: user_id, sdp },
            Some(user_id),
        );
        Ok(())
    }

    pub async fn handle_answer(
        self: &Arc<Self>,
        user_id: Uuid,
        call_id: Uuid,
        sdp: String,
    ) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }
        self.broadcast_to_room(
            call_id,
            &ServerMessage::Answer { call_id, from: user_id, sdp },
            Some(user_id),
        );
        Ok(())
    }

    /// Buffers the candidate; the first one in a window starts the flush
    /// timer. Candidates are pre-serialized fragments and are joined, never
    /// parsed.
    pub async fn handle_ice_candidate(
        self: &Arc<Self>,
        user_id: Uuid,
        call_id: Uuid,
        candidate: String,
    ) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }

        let key = (call_id, user_id);
        let first = match self.ice_batches.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get_mut().push(candidate);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(vec![candidate]);
                true
            }
        };

        if first {
            let hub = self.clone();
            let window = Duration::from_millis(self.timing.ice_batch_window_millis);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                hub.flush_ice_batch(call_id, user_id);
            });
        }
        Ok(())
    }

    fn flush_ice_batch(self: &Arc<Self>, call_id: Uuid, user_id: Uuid) {
        let Some((_, candidates)) = self.ice_batches.remove(&(call_id, user_id)) else {
            return;
        };
        let frame = merge_candidate_frame(call_id, user_id, &candidates);
        self.broadcast_raw_to_room(call_id, frame, Some(user_id));
    }

    pub async fn handle_ice_restart(self: &Arc<Self>, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }

        self.history.heartbeat(call_id).await?;
        let ice_config = self.ice.ice_config(user_id).await?;

        self.send_to_user(
            user_id,
            &ServerMessage::IceRestart {
                call_id,
                from: user_id,
                ice_config: Some(ice_config),
            },
        );
        self.broadcast_to_room(
            call_id,
            &ServerMessage::IceRestart { call_id, from: user_id, ice_config: None },
            Some(user_id),
        );
        Ok(())
    }

    pub async fn handle_ringing_ack(self: &Arc<Self>, _user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        self.clear_ack_timer(call_id);
        self.history.heartbeat(call_id).await?;
        Ok(())
    }

    /// Mid-call escalation from P2P to the SFU. Only allowed while the call
    /// is live; the whole room receives the new room and per-user tokens.
    pub async fn handle_switch_to_daily(self: &Arc<Self>, user_id: Uuid, call_id: Uuid) -> Result<(), AppError> {
        let session = self.require_session(call_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden("Not a participant of this call".to_string()));
        }
        if session.provider != CallProvider::P2p {
            return Err(AppError::BadInput("Call is already on the SFU".to_string()));
        }
        if !matches!(session.status, SessionStatus::Active | SessionStatus::Reconnecting) {
            return Err(AppError::BadInput("Call is not active".to_string()));
        }

        let party = session.all_user_ids();
        let room = self.sfu.create_room(call_id, party.len()).await?;

        let mut tokens = HashMap::new();
        for participant in &party {
            let token = self
                .sfu
                .create_meeting_token(
                    &room.name,
                    *participant,
                    &self.display_name(*participant),
                    *participant == session.caller_id,
                )
                .await?;
            tokens.insert(*participant, token);
        }

        self.history
            .update_provider(call_id, CallProvider::Sfu, Some(room.name.clone()))
            .await?;

        for participant in &party {
            self.send_to_user(
                *participant,
                &ServerMessage::DailyRoom {
                    call_id,
                    room_url: room.url.clone(),
                    meeting_token: tokens.get(participant).cloned(),
                    meeting_tokens: None,
                },
            );
        }
        Ok(())
    }

    // Timers

    fn start_ringing_timer(self: &Arc<Self>, call_id: Uuid) {
        let hub = self.clone();
        let timeout = Duration::from_secs(self.timing.ringing_timeout_seconds);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hub.ringing_timers.remove(&call_id);
            hub.ringing_expired(call_id).await;
        });
        if let Some(old) = self.ringing_timers.insert(call_id, handle) {
            old.abort();
        }
    }

    async fn ringing_expired(self: &Arc<Self>, call_id: Uuid) {
        let session = match self.history.get_session(call_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        // A group call someone already joined stays up; the timeout only
        // reaps calls still ringing.
        if session.status != SessionStatus::Ringing {
            return;
        }

        if let Err(e) = self.history.end_gracefully(call_id, EndReason::Timeout).await {
            tracing::error!("Ringing timeout finalization failed for {}: {}", call_id, e);
        }
    }

    /// 1-to-1 only: without a ringing-ack within the window, the callee's
    /// device probably never rendered the call; fall back to push.
    fn start_ack_timer(self: &Arc<Self>, call_id: Uuid) {
        let hub = self.clone();
        let timeout = Duration::from_millis(self.timing.ringing_ack_timeout_millis);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hub.ack_timers.remove(&call_id);
            hub.ack_expired(call_id).await;
        });
        if let Some(old) = self.ack_timers.insert(call_id, handle) {
            old.abort();
        }
    }

    async fn ack_expired(self: &Arc<Self>, call_id: Uuid) {
        let session = match self.history.get_session(call_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        if session.status != SessionStatus::Ringing {
            return;
        }
        let receivers = session.participant_ids.clone();
        self.emit_push_needed(&session, receivers, "RINGING_NOT_ACKED").await;
    }

    fn clear_ringing_timer(&self, call_id: Uuid) {
        if let Some((_, handle)) = self.ringing_timers.remove(&call_id) {
            handle.abort();
        }
    }

    fn clear_ack_timer(&self, call_id: Uuid) {
        if let Some((_, handle)) = self.ack_timers.remove(&call_id) {
            handle.abort();
        }
    }

    // Teardown

    async fn leave_group(self: &Arc<Self>, session: &ActiveCallSession, user_id: Uuid) {
        if let Err(e) = self.history.release_user_index(user_id, session.call_id).await {
            tracing::error!("Failed to release index for {}: {}", user_id, e);
        }
        self.leave_room(session.call_id, user_id);
        self.broadcast_to_room(
            session.call_id,
            &ServerMessage::ParticipantLeft { call_id: session.call_id, user_id },
            None,
        );
    }

    /// Reacts to a `call.ended` fan-out: tells the room, then drops every
    /// piece of hub state for the call. Runs for local finalizations and for
    /// ones another instance (or the block listener) performed.
    pub fn on_call_ended(
        self: &Arc<Self>,
        call_id: Uuid,
        status: TerminalCallStatus,
        reason: EndReason,
        duration_seconds: i64,
        provider_was_sfu: bool,
    ) {
        self.broadcast_to_room(
            call_id,
            &ServerMessage::Ended {
                call_id,
                status,
                reason,
                duration_seconds,
            },
            None,
        );
        let sfu_room = provider_was_sfu.then(|| SfuClient::room_name(call_id));
        self.teardown(call_id, sfu_room);
    }

    fn teardown(self: &Arc<Self>, call_id: Uuid, sfu_room: Option<String>) {
        self.clear_ringing_timer(call_id);
        self.clear_ack_timer(call_id);

        let grace_keys: Vec<(Uuid, Uuid)> = self
            .grace_timers
            .iter()
            .filter(|entry| entry.key().0 == call_id)
            .map(|entry| *entry.key())
            .collect();
        for key in grace_keys {
            if let Some((_, handle)) = self.grace_timers.remove(&key) {
                handle.abort();
            }
        }

        self.ice_batches.retain(|key, _| key.0 != call_id);
        self.rooms.remove(&call_id);

        // Room deletion is fire-and-forget; 404s are benign.
        if let Some(room_name) = sfu_room {
            let sfu = self.sfu.clone();
            tokio::spawn(async move {
                if let Err(e) = sfu.delete_room(&room_name).await {
                    tracing::warn!("SFU room {} cleanup failed: {}", room_name, e);
                }
            });
        }
    }

    // Delivery

    fn join_room(&self, call_id: Uuid, user_id: Uuid) {
        let mut members = self.rooms.entry(call_id).or_default();
        if !members.contains(&user_id) {
            members.push(user_id);
        }
    }

    fn leave_room(&self, call_id: Uuid, user_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(&call_id) {
            members.retain(|id| *id != user_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(&call_id);
            }
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections
            .get(&user_id)
            .map(|handles| !handles.is_empty())
            .unwrap_or(false)
    }

    fn display_name(&self, user_id: Uuid) -> String {
        self.connections
            .get(&user_id)
            .and_then(|handles| handles.first().map(|h| h.username.clone()))
            .unwrap_or_else(|| user_id.to_string())
    }

    pub fn send_to_user(&self, user_id: Uuid, message: &ServerMessage) {
        let Ok(payload) = serde_json::to_string(message) else {
            tracing::error!("Failed to serialize server frame");
            return;
        };
        self.send_raw_to_user(user_id, payload);
    }

    fn send_raw_to_user(&self, user_id: Uuid, payload: String) {
        let Some(handles) = self.connections.get(&user_id) else {
            return;
        };
        for handle in handles.iter() {
            if handle.sender.send(Message::Text(payload.clone())).is_err() {
                tracing::warn!("Dropping frame for closed socket {}", handle.socket_id);
            }
        }
    }

    fn broadcast_to_room(&self, call_id: Uuid, message: &ServerMessage, exclude: Option<Uuid>) {
        let Ok(payload) = serde_json::to_string(message) else {
            tracing::error!("Failed to serialize server frame");
            return;
        };
        self.broadcast_raw_to_room(call_id, payload, exclude);
    }

    fn broadcast_raw_to_room(&self, call_id: Uuid, payload: String, exclude: Option<Uuid>) {
        let members: Vec<Uuid> = self
            .rooms
            .get(&call_id)
            .map(|members| members.clone())
            .unwrap_or_default();
        for member in members {
            if Some(member) != exclude {
                self.send_raw_to_user(member, payload.clone());
            }
        }
    }

    async fn require_session(&self, call_id: Uuid) -> Result<ActiveCallSession, AppError> {
        self.history
            .get_session(call_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No active session for call {}", call_id)))
    }

    async fn emit_push_needed(&self, session: &ActiveCallSession, callee_ids: Vec<Uuid>, reason: &str) {
        let event = DomainEvent::new(
            EventSource::Calls,
            session.call_id.to_string(),
            EventPayload::CallPushNeeded {
                call_id: session.call_id,
                caller_id: session.caller_id,
                callee_ids,
                call_type: session.call_type.as_str().to_string(),
                reason: reason.to_string(),
            },
        );
        if let Err(e) = self.history.publisher().publish(&event).await {
            tracing::error!("Failed to publish push-needed for {}: {}", session.call_id, e);
        }
    }
}

/// Builds the relayed batch frame. Candidates arrive pre-serialized; the
/// server joins them with commas inside brackets and never parses them.
fn merge_candidate_frame(call_id: Uuid, from: Uuid, candidates: &[String]) -> String {
    format!(
        r#"{{"type":"call:ice-candidate","callId":"{}","from":"{}","candidates":[{}]}}"#,
        call_id,
        from,
        candidates.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_frame_is_valid_json_with_candidates_in_order() {
        let call_id = Uuid::new_v4();
        let from = Uuid::new_v4();
        let candidates = vec![
            r#"{"candidate":"candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host"}"#.to_string(),
            r#"{"candidate":"candidate:2 1 UDP 1686052607 198.51.100.1 54401 typ srflx"}"#.to_string(),
        ];

        let frame = merge_candidate_frame(call_id, from, &candidates);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(parsed["type"], "call:ice-candidate");
        assert_eq!(parsed["callId"], call_id.to_string());
        assert_eq!(parsed["candidates"].as_array().unwrap().len(), 2);
        assert!(parsed["candidates"][0]["candidate"]
            .as_str()
            .unwrap()
            .contains("typ host"));
    }

    #[test]
    fn single_candidate_still_wraps_in_an_array() {
        let frame = merge_candidate_frame(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &[r#"{"candidate":"candidate:1"}"#.to_string()],
        );
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["candidates"].as_array().unwrap().len(), 1);
    }
}
