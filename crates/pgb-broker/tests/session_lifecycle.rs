//! Session lifecycle integration tests
//!
//! Drives the broker state end to end with in-memory backends and a manual
//! clock.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pgb_broker::backend::MemoryConnector;
use pgb_broker::{BrokerState, ConnectOptions};
use pgb_core::config::BrokerConfig;
use pgb_core::{BrokerError, ManualClock, SessionId};

/// Create broker state with the given idle threshold and a manual clock
fn create_test_state(
    idle_timeout: Duration,
) -> (Arc<BrokerState>, Arc<MemoryConnector>, Arc<ManualClock>) {
    let config = BrokerConfig {
        idle_timeout,
        cleanup_interval: Duration::from_secs(60),
        ..BrokerConfig::default()
    };
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let connector = Arc::new(MemoryConnector::new());
    let options = ConnectOptions::from_config(&config).with_clock(clock.clone());

    let state = BrokerState::with_options(config, connector.clone(), options);
    (Arc::new(state), connector, clock)
}

#[tokio::test]
async fn test_zero_threshold_cleanup_closes_every_session() {
    let (state, connector, clock) = create_test_state(Duration::ZERO);

    let mut backends = Vec::new();
    for id in ["alpha", "beta", "gamma"] {
        state
            .connect(id, "postgres://app:pw@db.internal/app", None)
            .await
            .unwrap();
        backends.push(connector.last_backend().unwrap());
    }
    assert_eq!(state.sessions.len(), 3);

    clock.advance(Duration::from_millis(1));
    assert_eq!(state.sessions.cleanup().await, 3);

    assert!(state.sessions.is_empty());
    for backend in backends {
        assert_eq!(backend.close_count(), 1);
    }
}

#[tokio::test]
async fn test_failed_queries_still_age_out() {
    let (state, connector, clock) = create_test_state(Duration::from_secs(600));

    let conn = state
        .connect("broken", "postgres://app@db.internal/app", None)
        .await
        .unwrap();
    let backend = connector.last_backend().unwrap();
    backend.fail_queries(Some("server closed the connection unexpectedly"));

    clock.advance(Duration::from_secs(300));
    assert!(conn.query("SELECT 1").await.is_err());
    assert!(conn.history().is_empty());

    clock.advance(Duration::from_secs(500));
    assert_eq!(state.sessions.cleanup().await, 0);

    clock.advance(Duration::from_secs(101));
    assert_eq!(state.sessions.cleanup().await, 1);
    assert!(matches!(
        conn.query("SELECT 1").await,
        Err(BrokerError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn test_reconnect_under_same_id_replaces_session() {
    let (state, connector, _clock) = create_test_state(Duration::from_secs(600));

    let first = state
        .connect("s1", "postgres://app@db.internal/one", None)
        .await
        .unwrap();
    let first_backend = connector.last_backend().unwrap();

    let second = state
        .connect("s1", "postgres://app@db.internal/two", None)
        .await
        .unwrap();

    assert!(first.is_closed());
    assert_eq!(first_backend.close_count(), 1);
    assert!(!second.is_closed());
    assert_eq!(state.sessions.ids(), vec![SessionId::from("s1")]);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_reclaims_idle_sessions() {
    let (state, _connector, clock) = create_test_state(Duration::from_secs(180 * 60));

    let idle = state
        .connect("idle", "postgres://app@db.internal/app", None)
        .await
        .unwrap();
    let active = state
        .connect("active", "postgres://app@db.internal/app", None)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let reaper = state.spawn_reaper(cancel.clone()).unwrap();
    assert!(state.spawn_reaper(cancel.clone()).is_none());

    clock.advance(Duration::from_secs(180 * 60));
    active.query("SELECT 1").await.unwrap();
    clock.advance(Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(idle.is_closed());
    assert!(!active.is_closed());
    assert_eq!(state.sessions.ids(), vec![SessionId::from("active")]);

    cancel.cancel();
    reaper.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions() {
    let (state, connector, _clock) = create_test_state(Duration::from_secs(600));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let id = format!("session-{}", i % 8);
                let conn = state
                    .connect(id.as_str(), "postgres://app@db.internal/app", None)
                    .await
                    .unwrap();
                // May already be replaced by another task; both outcomes are valid
                let _ = conn.query("SELECT 1").await;
                if let Some(current) = state.sessions.get(&id) {
                    let _ = current.query("SELECT 2").await;
                }
                if i % 2 == 0 {
                    state.sessions.remove(&id).await;
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(state.sessions.len() <= 8);
    assert_eq!(connector.urls().len(), 32);

    state.shutdown().await;
    assert!(state.sessions.is_empty());
}
