//! A live database connection, optionally carried over an SSH tunnel

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use pgb_core::conn_string;
use pgb_core::time::elapsed_between;
use pgb_core::{BrokerError, Clock, ConnectivityError, HistoryRecord, SshInfo};

use super::options::ConnectOptions;

const NANOS_PER_MILLI: u64 = 1_000_000;
use crate::backend::{Backend, BackendConnector, QueryResult};
use crate::tunnel::Tunnel;

/// Snapshot of a connection for listings and debugging
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection URL with the password masked
    pub connection_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelInfo>,
    pub history_len: usize,
    /// Unix milliseconds
    pub last_used: u64,
    pub idle_secs: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bastion: Option<String>,
    pub local_port: u16,
    pub target: String,
}

/// One session's database handle.
///
/// Queries may run concurrently. `last_used` is bumped after every query,
/// failed ones included, while the history only records successes.
pub struct Connection {
    connection_string: String,
    backend: Arc<dyn Backend>,
    tunnel: Option<Tunnel>,
    history: Mutex<Vec<HistoryRecord>>,
    /// Unix nanoseconds
    last_used: AtomicU64,
    closed: AtomicBool,
    idle_threshold: Duration,
    query_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Open a connection to `url`.
    ///
    /// With a bastion descriptor, a tunnel to the URL's host and port is
    /// started first and the backend is opened against its local end. The
    /// tunnel is closed again if anything after it fails.
    pub async fn open(
        url: &str,
        ssh: Option<&SshInfo>,
        connector: &dyn BackendConnector,
        options: &ConnectOptions,
    ) -> Result<Self, BrokerError> {
        let Some(ssh) = ssh else {
            let backend = connector.connect(url).await?;
            return Ok(Self::new(url, backend, None, options));
        };

        let (target_host, target_port) = conn_string::target_endpoint(url)?;
        let tunnel = Tunnel::start(ssh, &target_host, target_port, &options.tunnel).await?;
        Self::open_with_tunnel(url, tunnel, connector, options).await
    }

    /// Open the backend through a running tunnel to the URL's endpoint.
    ///
    /// The backend is pointed at `127.0.0.1:<local_port>`. On failure the
    /// tunnel is closed and its port released.
    pub async fn open_with_tunnel(
        url: &str,
        tunnel: Tunnel,
        connector: &dyn BackendConnector,
        options: &ConnectOptions,
    ) -> Result<Self, BrokerError> {
        let opened = match conn_string::rewrite_endpoint(url, "127.0.0.1", tunnel.local_port()) {
            Ok(local_url) => connector.connect(&local_url).await,
            Err(e) => Err(e),
        };

        match opened {
            Ok(backend) => Ok(Self::new(url, backend, Some(tunnel), options)),
            Err(e) => {
                tunnel.close().await;
                Err(e)
            }
        }
    }

    /// Wrap an already opened backend
    pub fn new(
        connection_string: &str,
        backend: Arc<dyn Backend>,
        tunnel: Option<Tunnel>,
        options: &ConnectOptions,
    ) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            backend,
            tunnel,
            history: Mutex::new(Vec::new()),
            last_used: AtomicU64::new(options.clock.now_nanos()),
            closed: AtomicBool::new(false),
            idle_threshold: options.idle_threshold,
            query_timeout: options.query_timeout,
            clock: Arc::clone(&options.clock),
        }
    }

    /// Probe the database with a trivial round trip
    pub async fn test(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.backend.ping().await {
            Ok(()) => Ok(()),
            Err(e @ (BrokerError::Connectivity(_) | BrokerError::AlreadyClosed)) => Err(e),
            Err(e) => Err(ConnectivityError::classify(e.to_string()).into()),
        }
    }

    /// Run a statement against the backend
    pub async fn query(&self, sql: &str) -> Result<QueryResult, BrokerError> {
        self.ensure_open()?;

        let result = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, self.backend.query(sql))
                .await
                .unwrap_or_else(|_| {
                    Err(BrokerError::Query(format!(
                        "Query timed out after {:?}",
                        limit
                    )))
                }),
            None => self.backend.query(sql).await,
        };

        let now = self.clock.now_nanos();
        self.last_used.store(now, Ordering::Release);
        if result.is_ok() {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(HistoryRecord::new(sql, now / NANOS_PER_MILLI));
        }

        result
    }

    /// Whether the connection has gone unused for longer than its threshold
    pub fn is_idle(&self) -> bool {
        self.idle_for() > self.idle_threshold
    }

    /// Time since the last query, or since opening
    pub fn idle_for(&self) -> Duration {
        elapsed_between(
            self.clock.now_nanos(),
            self.last_used.load(Ordering::Acquire),
        )
    }

    /// Unix milliseconds of the last query
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire) / NANOS_PER_MILLI
    }

    /// Close the tunnel, then the backend.
    ///
    /// Only the first call does anything; later calls return
    /// [`BrokerError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyClosed);
        }

        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
        self.backend.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Successful queries in execution order
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// URL as given, password included
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// URL with the password masked
    pub fn redacted_connection_string(&self) -> String {
        conn_string::redact(&self.connection_string)
    }

    pub fn tunnel(&self) -> Option<&Tunnel> {
        self.tunnel.as_ref()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_string: self.redacted_connection_string(),
            tunnel: self.tunnel.as_ref().map(|tunnel| TunnelInfo {
                bastion: tunnel.bastion().map(str::to_string),
                local_port: tunnel.local_port(),
                target: tunnel.target(),
            }),
            history_len: self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            last_used: self.last_used(),
            idle_secs: self.idle_for().as_secs(),
            closed: self.is_closed(),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_string", &self.redacted_connection_string())
            .field("tunnel", &self.tunnel.as_ref().map(Tunnel::local_port))
            .field("last_used", &self.last_used())
            .field("closed", &self.is_closed())
            .finish()
    }
}
