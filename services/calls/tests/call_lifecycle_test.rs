use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use wavechat_calls::config::CallTimingConfig;
use wavechat_calls::history::CallHistoryService;
use wavechat_calls::models::{CallProvider, CallType, EndReason};
use wavechat_calls::state_machine::CallEvent;
use wavechat_common::{CacheService, ManualClock, RedisConfig};
use wavechat_events::{EventPublisher, TerminalCallStatus};

fn infra_available() -> bool {
    if (std::env::var("REDIS_HOST").is_err() && std::env::var("REDIS_URL").is_err())
        || (std::env::var("DATABASE_HOST").is_err() && std::env::var("DATABASE_URL").is_err())
    {
        println!("Skipping call lifecycle test - Redis/Postgres not configured");
        return false;
    }
    true
}

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        format!(
            "postgresql://wavechat_user:wavechat_password@{}:5432/wavechat_test",
            std::env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string())
        )
    });

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id UUID PRIMARY KEY,
            initiator_id UUID NOT NULL,
            participant_count INT NOT NULL,
            call_type TEXT NOT NULL,
            provider TEXT NOT NULL,
            conversation_id UUID,
            status TEXT NOT NULL,
            end_reason TEXT,
            duration_seconds BIGINT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ NOT NULL,
            deleted_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create calls table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_participants (
            call_id UUID NOT NULL,
            user_id UUID NOT NULL,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            joined_at TIMESTAMPTZ,
            left_at TIMESTAMPTZ,
            PRIMARY KEY (call_id, user_id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create call_participants table");

    pool
}

fn test_timing() -> CallTimingConfig {
    CallTimingConfig {
        ringing_timeout_seconds: 30,
        ringing_ack_timeout_millis: 2000,
        disconnect_grace_seconds: 3,
        ice_batch_window_millis: 50,
        session_ttl_seconds: 300,
        end_lock_ttl_millis: 5000,
        end_result_ttl_seconds: 10,
        end_lock_wait_millis: 3000,
        missed_viewed_ttl_seconds: 90 * 24 * 3600,
        missed_count_ttl_seconds: 30,
        max_call_duration_seconds: 24 * 3600,
    }
}

async fn test_service(clock: ManualClock) -> CallHistoryService {
    let redis = RedisConfig {
        host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: 6379,
        password: None,
        database: 15,
    };
    let cache = CacheService::new(&redis).await.expect("Failed to connect to Redis");
    let pool = test_pool().await;

    CallHistoryService::new(
        pool,
        cache,
        EventPublisher::new(None),
        Arc::new(clock),
        test_timing(),
    )
}

#[tokio::test]
async fn successful_one_to_one_call_persists_completed_history() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock.clone()).await;

    let caller = Uuid::new_v4();
    let callee = Uuid::new_v4();

    let session = service
        .start_call(caller, callee, CallType::Voice, CallProvider::P2p, None, &[])
        .await
        .expect("start failed");

    // Busy check: neither side can start another call
    let busy = service
        .start_call(caller, Uuid::new_v4(), CallType::Voice, CallProvider::P2p, None, &[])
        .await
        .unwrap_err();
    assert_eq!(busy.error_code(), "CONFLICT");

    clock.advance(Duration::seconds(4));
    service
        .update_status(session.call_id, CallEvent::Accept)
        .await
        .expect("accept failed");

    clock.advance(Duration::seconds(16));
    let response = service
        .end_call(
            session.call_id,
            TerminalCallStatus::Completed,
            EndReason::UserHangup,
            None,
        )
        .await
        .expect("end failed");

    // Duration counts from the answer, not the first ring
    assert_eq!(response.status, TerminalCallStatus::Completed);
    assert_eq!(response.duration_seconds, 16);
    assert_eq!(response.participant_count, 2);
    assert!(response.started_at < response.ended_at);

    // Session and busy index are gone
    assert!(service.get_session(session.call_id).await.unwrap().is_none());
    assert!(service.get_session_by_user(caller).await.unwrap().is_none());

    // Participant rows: exactly one host, both joined
    let service_pool = test_pool().await;
    let rows = sqlx::query(
        "SELECT role, status FROM call_participants WHERE call_id = $1 ORDER BY role",
    )
    .bind(session.call_id)
    .fetch_all(&service_pool)
    .await
    .expect("participant query failed");
    assert_eq!(rows.len(), 2);
    let roles: Vec<String> = rows.iter().map(|r| r.try_get("role").unwrap()).collect();
    assert_eq!(roles, vec!["host".to_string(), "member".to_string()]);
    for row in &rows {
        let status: String = row.try_get("status").unwrap();
        assert_eq!(status, "joined");
    }

    // A completed call does not bump the missed badge
    assert_eq!(service.missed_count(callee).await.unwrap(), 0);
}

#[tokio::test]
async fn no_answer_bumps_the_missed_badge_until_viewed() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock.clone()).await;

    let caller = Uuid::new_v4();
    let callee = Uuid::new_v4();

    service.mark_missed_viewed(callee).await.expect("mark viewed failed");

    let session = service
        .start_call(caller, callee, CallType::Voice, CallProvider::P2p, None, &[])
        .await
        .expect("start failed");

    clock.advance(Duration::seconds(30));
    let response = service
        .end_gracefully(session.call_id, EndReason::Timeout)
        .await
        .expect("graceful end failed")
        .expect("session should exist");

    assert_eq!(response.status, TerminalCallStatus::NoAnswer);
    assert_eq!(response.duration_seconds, 0);

    assert_eq!(service.missed_count(callee).await.unwrap(), 1);

    service.mark_missed_viewed(callee).await.expect("mark viewed failed");
    assert_eq!(service.missed_count(callee).await.unwrap(), 0);
}

#[tokio::test]
async fn caller_cancel_during_ringing_marks_host_left() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock.clone()).await;

    let caller = Uuid::new_v4();
    let callee = Uuid::new_v4();
    let session = service
        .start_call(caller, callee, CallType::Video, CallProvider::P2p, None, &[])
        .await
        .expect("start failed");

    clock.advance(Duration::seconds(3));
    let response = service
        .end_call(
            session.call_id,
            TerminalCallStatus::Cancelled,
            EndReason::Cancelled,
            None,
        )
        .await
        .expect("cancel failed");

    assert_eq!(response.status, TerminalCallStatus::Cancelled);

    let pool = test_pool().await;
    let rows = sqlx::query(
        "SELECT user_id, status FROM call_participants WHERE call_id = $1",
    )
    .bind(session.call_id)
    .fetch_all(&pool)
    .await
    .expect("participant query failed");
    for row in rows {
        let user_id: Uuid = row.try_get("user_id").unwrap();
        let status: String = row.try_get("status").unwrap();
        if user_id == caller {
            assert_eq!(status, "left");
        } else {
            assert_eq!(status, "missed");
        }
    }
}

#[tokio::test]
async fn concurrent_ends_resolve_to_one_record_and_equal_responses() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock.clone()).await;

    let caller = Uuid::new_v4();
    let callee = Uuid::new_v4();
    let session = service
        .start_call(caller, callee, CallType::Voice, CallProvider::P2p, None, &[])
        .await
        .expect("start failed");
    service
        .update_status(session.call_id, CallEvent::Accept)
        .await
        .expect("accept failed");
    clock.advance(Duration::seconds(10));

    let (a, b) = tokio::join!(
        service.end_call(
            session.call_id,
            TerminalCallStatus::Completed,
            EndReason::UserHangup,
            None,
        ),
        service.end_call(
            session.call_id,
            TerminalCallStatus::Completed,
            EndReason::UserHangup,
            None,
        ),
    );

    let a = a.expect("first end failed");
    let b = b.expect("second end failed");
    assert_eq!(a.call_id, b.call_id);
    assert_eq!(a.duration_seconds, b.duration_seconds);
    assert_eq!(a.status, b.status);

    let pool = test_pool().await;
    let row = sqlx::query("SELECT COUNT(*) AS n FROM calls WHERE id = $1")
        .bind(session.call_id)
        .fetch_one(&pool)
        .await
        .expect("count failed");
    let n: i64 = row.try_get("n").unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn self_call_and_empty_receivers_are_bad_input() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock).await;

    let user = Uuid::new_v4();
    let err = service
        .start_call(user, user, CallType::Voice, CallProvider::P2p, None, &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_INPUT");

    // Every extra receiver collapses onto the caller after dedup
    let other = Uuid::new_v4();
    let err = service
        .start_call(user, other, CallType::Voice, CallProvider::P2p, None, &[other, other, user])
        .await
        .map(|session| session.participant_ids.len());
    assert_eq!(err.expect("dedup start failed"), 1);
    service.cleanup_user_sessions(user).await.expect("cleanup failed");
}

#[tokio::test]
async fn group_start_forces_sfu_provider() {
    if !infra_available() {
        return;
    }
    let clock = ManualClock::new(Utc::now());
    let service = test_service(clock).await;

    let caller = Uuid::new_v4();
    let receivers = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

    let session = service
        .start_call(
            caller,
            receivers[0],
            CallType::Voice,
            CallProvider::P2p,
            Some(Uuid::new_v4()),
            &receivers[1..],
        )
        .await
        .expect("group start failed");

    assert!(session.is_group_call());
    assert_eq!(session.provider, CallProvider::Sfu);
    assert_eq!(session.participant_ids.len(), 3);

    let response = service
        .end_call(
            session.call_id,
            TerminalCallStatus::Cancelled,
            EndReason::Cancelled,
            Some(0),
        )
        .await
        .expect("end failed");
    assert_eq!(response.participant_count, 4);
    assert_eq!(response.duration_seconds, 0);
}
