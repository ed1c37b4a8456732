//! Session table mapping client-chosen IDs to connections

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pgb_core::{BrokerError, SessionId};

use crate::connection::Connection;

/// Owns every live connection, keyed by session ID.
///
/// Entries are detached from the table before their connection is closed,
/// so no map lock is ever held across a close.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Connection>>,
    idle_eviction: bool,
    pub(super) reaper_running: AtomicBool,
}

impl SessionManager {
    /// Create a manager that evicts idle sessions on cleanup
    pub fn new() -> Self {
        Self::with_idle_eviction(true)
    }

    /// Create a manager; with eviction off, cleanup never removes anything
    pub fn with_idle_eviction(idle_eviction: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_eviction,
            reaper_running: AtomicBool::new(false),
        }
    }

    /// Register a connection under `id`.
    ///
    /// A different connection already stored under the same ID is closed.
    /// Returns whether one was replaced.
    pub async fn add(&self, id: impl Into<SessionId>, conn: Arc<Connection>) -> bool {
        let id = id.into();
        match self.sessions.insert(id.clone(), Arc::clone(&conn)) {
            Some(previous) if !Arc::ptr_eq(&previous, &conn) => {
                tracing::info!(
                    sessions = self.sessions.len(),
                    "Session {} replaced, closing previous connection",
                    id
                );
                close_detached(&id, &previous).await;
                true
            }
            _ => {
                tracing::info!(sessions = self.sessions.len(), "Session {} added", id);
                false
            }
        }
    }

    /// Get a session's connection
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.sessions.get(id).map(|r| Arc::clone(&r))
    }

    /// Remove a session and close its connection.
    ///
    /// A failing close is logged and the session stays removed. Returns
    /// whether the session existed.
    pub async fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((id, conn)) => {
                tracing::info!(sessions = self.sessions.len(), "Session {} removed", id);
                close_detached(&id, &conn).await;
                true
            }
            None => false,
        }
    }

    /// IDs of all sessions, sorted
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Copy of the session table
    pub fn sessions(&self) -> HashMap<SessionId, Arc<Connection>> {
        self.sessions
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn idle_eviction(&self) -> bool {
        self.idle_eviction
    }

    /// Remove and close every idle session. Returns how many were removed.
    ///
    /// Candidates are collected first. A candidate that was replaced or used
    /// again before its removal is left alone.
    pub async fn cleanup(&self) -> usize {
        if !self.idle_eviction {
            return 0;
        }

        let stale: Vec<(SessionId, Arc<Connection>)> = self
            .sessions
            .iter()
            .filter(|r| r.value().is_idle())
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut removed = 0;
        for (id, conn) in stale {
            let detached = self.sessions.remove_if(&id, |_, current| {
                Arc::ptr_eq(current, &conn) && current.is_idle()
            });
            if detached.is_some() {
                tracing::info!(
                    "Removing idle session {} (unused for {:?})",
                    id,
                    conn.idle_for()
                );
                close_detached(&id, &conn).await;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(
                sessions = self.sessions.len(),
                "Cleaned up {} idle sessions",
                removed
            );
        }
        removed
    }

    /// Remove and close every session. Returns how many there were.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(SessionId, Arc<Connection>)> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.sessions.remove(id.as_str()))
            .collect();

        futures::future::join_all(drained.iter().map(|(id, conn)| close_detached(id, conn)))
            .await;
        tracing::debug!(sessions = self.sessions.len(), "Closed {} sessions", drained.len());
        drained.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn close_detached(id: &SessionId, conn: &Connection) {
    match conn.close().await {
        Ok(()) => {}
        Err(BrokerError::AlreadyClosed) => {
            tracing::debug!("Session {} was already closed", id);
        }
        Err(e) => {
            tracing::warn!("Failed to close session {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::connection::ConnectOptions;
    use pgb_core::{ManualClock, SystemClock};
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn connection(
        clock: &Arc<ManualClock>,
        threshold: Duration,
    ) -> (Arc<Connection>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let options = ConnectOptions::default()
            .with_clock(clock.clone())
            .with_idle_threshold(threshold);
        let conn = Connection::new("postgres://u:p@h/db", backend.clone(), None, &options);
        (Arc::new(conn), backend)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (conn, _) = connection(&clock, Duration::from_secs(60));

        assert!(!sessions.add("s1", Arc::clone(&conn)).await);

        let stored = sessions.get("s1").unwrap();
        assert!(Arc::ptr_eq(&stored, &conn));
        assert!(sessions.get("s2").is_none());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.ids(), vec![SessionId::from("s1")]);
    }

    #[tokio::test]
    async fn test_add_replaces_and_closes_previous() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (first, first_backend) = connection(&clock, Duration::from_secs(60));
        let (second, second_backend) = connection(&clock, Duration::from_secs(60));

        sessions.add("s1", Arc::clone(&first)).await;
        assert!(sessions.add("s1", Arc::clone(&second)).await);

        assert!(first.is_closed());
        assert_eq!(first_backend.close_count(), 1);
        assert_eq!(second_backend.close_count(), 0);
        assert!(Arc::ptr_eq(&sessions.get("s1").unwrap(), &second));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_re_adding_same_connection_keeps_it_open() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (conn, backend) = connection(&clock, Duration::from_secs(60));

        sessions.add("s1", Arc::clone(&conn)).await;
        assert!(!sessions.add("s1", Arc::clone(&conn)).await);
        assert_eq!(backend.close_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_closes_connection() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (conn, backend) = connection(&clock, Duration::from_secs(60));
        sessions.add("s1", conn).await;

        assert!(sessions.remove("s1").await);
        assert!(!sessions.remove("s1").await);
        assert!(!sessions.remove("missing").await);

        assert!(sessions.is_empty());
        assert_eq!(backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_survives_close_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (conn, backend) = connection(&clock, Duration::from_secs(60));
        backend.fail_close(Some("server closed the connection unexpectedly"));
        sessions.add("s1", conn).await;

        assert!(sessions.remove("s1").await);
        assert!(sessions.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_with_zero_threshold_removes_everything() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let mut backends = Vec::new();
        for id in ["a", "b", "c"] {
            let (conn, backend) = connection(&clock, Duration::ZERO);
            sessions.add(id, conn).await;
            backends.push(backend);
        }

        clock.advance(Duration::from_millis(1));
        assert_eq!(sessions.cleanup().await, 3);

        assert!(sessions.is_empty());
        assert!(backends.iter().all(|b| b.close_count() == 1));
    }

    #[tokio::test]
    async fn test_cleanup_with_zero_threshold_on_system_clock() {
        let options = ConnectOptions::default()
            .with_clock(Arc::new(SystemClock))
            .with_idle_threshold(Duration::ZERO);

        for _ in 0..200 {
            let sessions = SessionManager::new();
            let conn = Connection::new(
                "postgres://u:p@h/db",
                Arc::new(MemoryBackend::new()),
                None,
                &options,
            );
            sessions.add("s1", Arc::new(conn)).await;

            assert_eq!(sessions.cleanup().await, 1);
            assert_eq!(sessions.len(), 0);
        }
    }

    #[tokio::test]
    async fn test_session_count_is_logged() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (a, _) = connection(&clock, Duration::ZERO);
        let (b, _) = connection(&clock, Duration::from_secs(60));
        sessions.add("a", a).await;
        sessions.add("b", b).await;
        assert!(logs.contents().contains("sessions=2"));

        clock.advance(Duration::from_millis(1));
        sessions.cleanup().await;
        sessions.remove("b").await;

        let output = logs.contents();
        assert!(output.contains("Cleaned up 1 idle sessions sessions=1"));
        assert!(output.contains("Session b removed sessions=0"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recently_used_sessions() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (stale, _) = connection(&clock, Duration::from_secs(60));
        let (busy, _) = connection(&clock, Duration::from_secs(60));
        sessions.add("stale", stale).await;
        sessions.add("busy", Arc::clone(&busy)).await;

        clock.advance(Duration::from_secs(90));
        busy.query("SELECT 1").await.unwrap();

        assert_eq!(sessions.cleanup().await, 1);
        assert_eq!(sessions.ids(), vec![SessionId::from("busy")]);
        assert_eq!(sessions.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_disabled() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::with_idle_eviction(false);
        let (conn, _) = connection(&clock, Duration::ZERO);
        sessions.add("s1", conn).await;

        clock.advance(Duration::from_secs(3600));
        assert_eq!(sessions.cleanup().await, 0);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_is_a_copy() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (conn, _) = connection(&clock, Duration::from_secs(60));
        sessions.add("s1", conn).await;

        let mut copy = sessions.sessions();
        copy.clear();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionManager::new();
        let (a, a_backend) = connection(&clock, Duration::from_secs(60));
        let (b, b_backend) = connection(&clock, Duration::from_secs(60));
        sessions.add("a", a).await;
        sessions.add("b", b).await;

        assert_eq!(sessions.close_all().await, 2);
        assert!(sessions.is_empty());
        assert_eq!(a_backend.close_count(), 1);
        assert_eq!(b_backend.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_remove_closes_once() {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = Arc::new(SessionManager::new());
        let (conn, backend) = connection(&clock, Duration::from_secs(60));
        sessions.add("s1", conn).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move { sessions.remove("s1").await })
            })
            .collect();

        let mut removed = 0;
        for task in tasks {
            if task.await.unwrap() {
                removed += 1;
            }
        }

        assert_eq!(removed, 1);
        assert_eq!(backend.close_count(), 1);
    }
}
