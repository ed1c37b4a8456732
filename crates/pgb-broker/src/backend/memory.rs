//! In-process backend with scripted behavior
//!
//! Answers every query with a fixed result and records what it was asked.
//! Failures can be switched on per backend, which is what the session and
//! connection tests drive.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use pgb_core::{BrokerError, ConnectivityError};

use super::{Backend, BackendConnector, QueryResult};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    result: QueryResult,
    executed: Mutex<Vec<String>>,
    query_error: Mutex<Option<String>>,
    ping_error: Mutex<Option<String>>,
    close_error: Mutex<Option<String>>,
    closes: AtomicUsize,
}

impl MemoryBackend {
    /// Backend answering `?column? = 1` to everything
    pub fn new() -> Self {
        Self::with_result(QueryResult::new(
            vec!["?column?".to_string()],
            vec![vec![Value::from(1)]],
        ))
    }

    pub fn with_result(result: QueryResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    /// Make queries fail with `message`, or succeed again with `None`
    pub fn fail_queries(&self, message: Option<&str>) {
        *lock(&self.query_error) = message.map(str::to_string);
    }

    /// Make pings fail with `message`, or succeed again with `None`
    pub fn fail_ping(&self, message: Option<&str>) {
        *lock(&self.ping_error) = message.map(str::to_string);
    }

    /// Make `close` report `message` as an error
    pub fn fail_close(&self, message: Option<&str>) {
        *lock(&self.close_error) = message.map(str::to_string);
    }

    /// Statements submitted so far, failed ones included
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<(), BrokerError> {
        match lock(&self.ping_error).clone() {
            Some(message) => Err(ConnectivityError::classify(message).into()),
            None => Ok(()),
        }
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, BrokerError> {
        lock(&self.executed).push(sql.to_string());
        match lock(&self.query_error).clone() {
            Some(message) => Err(BrokerError::Query(message)),
            None => Ok(self.result.clone()),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match lock(&self.close_error).clone() {
            Some(message) => Err(BrokerError::Query(message)),
            None => Ok(()),
        }
    }
}

/// Hands out a fresh [`MemoryBackend`] per connect and keeps them for
/// inspection
#[derive(Debug, Default)]
pub struct MemoryConnector {
    refuse: AtomicBool,
    urls: Mutex<Vec<String>>,
    backends: Mutex<Vec<Arc<MemoryBackend>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following connect fail
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// URLs connected to, in order
    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }

    /// Most recently opened backend
    pub fn last_backend(&self) -> Option<Arc<MemoryBackend>> {
        lock(&self.backends).last().cloned()
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Backend>, BrokerError> {
        lock(&self.urls).push(url.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Dial(format!("connection refused: {}", url)));
        }

        let backend = Arc::new(MemoryBackend::new());
        lock(&self.backends).push(Arc::clone(&backend));
        Ok(backend)
    }
}
