//! Broker state shared by the command handlers

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pgb_core::config::BrokerConfig;
use pgb_core::{conn_string, BrokerError, SessionId, SshInfo};

use crate::backend::BackendConnector;
use crate::connection::{ConnectOptions, Connection};
use crate::session::SessionManager;

/// Configuration, session table and backend connector of one broker
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Session manager
    pub sessions: Arc<SessionManager>,
    /// Opens database handles
    pub connector: Arc<dyn BackendConnector>,
    /// Applied to every connection opened through [`BrokerState::connect`]
    pub options: ConnectOptions,
}

impl BrokerState {
    pub fn new(config: BrokerConfig, connector: Arc<dyn BackendConnector>) -> Self {
        let options = ConnectOptions::from_config(&config);
        Self::with_options(config, connector, options)
    }

    /// Create state with explicit connection options, e.g. a test clock
    pub fn with_options(
        config: BrokerConfig,
        connector: Arc<dyn BackendConnector>,
        options: ConnectOptions,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionManager::with_idle_eviction(config.idle_eviction)),
            config,
            connector,
            options,
        }
    }

    /// Open, probe and register a connection under `id`.
    ///
    /// The URL is normalized first. A connection whose probe fails is closed
    /// and never registered.
    pub async fn connect(
        &self,
        id: impl Into<SessionId>,
        url: &str,
        ssh: Option<&SshInfo>,
    ) -> Result<Arc<Connection>, BrokerError> {
        let id = id.into();
        let url = conn_string::format_url(url, self.config.ssl_mode.as_deref())?;
        tracing::info!("Opening session {} to {}", id, conn_string::redact(&url));

        let conn = Connection::open(&url, ssh, self.connector.as_ref(), &self.options).await?;
        if let Err(e) = conn.test().await {
            if let Err(close_err) = conn.close().await {
                tracing::debug!("Closing failed connection: {}", close_err);
            }
            return Err(e);
        }

        let conn = Arc::new(conn);
        self.sessions.add(id, Arc::clone(&conn)).await;
        Ok(conn)
    }

    /// Start the idle reaper, unless eviction is disabled
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.idle_eviction {
            tracing::info!("Idle eviction disabled");
            return None;
        }
        self.sessions
            .spawn_reaper(self.config.cleanup_interval, cancel)
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let closed = self.sessions.close_all().await;
        if closed > 0 {
            tracing::info!("Closed {} sessions", closed);
        }
    }
}
