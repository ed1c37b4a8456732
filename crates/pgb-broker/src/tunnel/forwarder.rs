//! Local port forwarding through an SSH bastion

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pgb_core::config::BrokerConfig;
use pgb_core::{BrokerError, SshInfo};

use super::auth::TunnelAuth;
use super::handler::TunnelClientHandler;
use super::pipe::{pipe, ChannelOpener, SshChannelOpener};
use crate::port::{PortAllocator, PortReservation};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Source of inbound connections for the accept loop
#[async_trait]
trait Accept: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Settings shared by every tunnel a broker opens
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Deadline for TCP connect plus SSH handshake
    pub connect_timeout: Duration,
    /// Key tried when a descriptor names none
    pub default_key_path: PathBuf,
    /// Where local listener ports come from
    pub ports: PortAllocator,
}

impl TunnelOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            connect_timeout: config.ssh_connect_timeout,
            default_key_path: config.default_key_path.clone(),
            ports: PortAllocator::new(config.port_range_start, config.port_range_limit),
        }
    }
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

/// A running local forwarder.
///
/// Every connection accepted on `127.0.0.1:local_port` gets its own channel
/// to the target and its own pipe. Dropping the tunnel without calling
/// [`Tunnel::close`] still stops the accept loop.
pub struct Tunnel {
    target_host: String,
    target_port: u16,
    local_port: u16,
    bastion: Option<String>,
    opener: Arc<dyn ChannelOpener>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Dial and authenticate the bastion, then start forwarding a local port
    /// to `target_host:target_port`.
    ///
    /// No local port is taken until the SSH session is authenticated.
    pub async fn start(
        info: &SshInfo,
        target_host: &str,
        target_port: u16,
        options: &TunnelOptions,
    ) -> Result<Self, BrokerError> {
        let auth = TunnelAuth::configure(info, &options.default_key_path)?;
        let endpoint = info.endpoint();

        tracing::debug!("Connecting to bastion {}", info);
        let handler = TunnelClientHandler::new(endpoint.clone());
        let mut session = tokio::time::timeout(
            options.connect_timeout,
            client::connect(Arc::new(Config::default()), endpoint.as_str(), handler),
        )
        .await
        .map_err(|_| {
            BrokerError::Dial(format!(
                "Connection to {} timed out after {:?}",
                endpoint, options.connect_timeout
            ))
        })?
        .map_err(|e| BrokerError::Dial(format!("Failed to connect to {}: {}", endpoint, e)))?;

        auth.authenticate(&mut session).await?;
        tracing::debug!("Authenticated to {} as '{}'", endpoint, info.user);

        let opener = Arc::new(SshChannelOpener::new(session));
        let mut tunnel =
            match Self::serve(opener.clone(), target_host, target_port, &options.ports).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    opener.shutdown().await;
                    return Err(e);
                }
            };
        tunnel.bastion = Some(info.to_string());
        Ok(tunnel)
    }

    /// Bind a local port and forward accepted connections through `opener`
    pub async fn serve(
        opener: Arc<dyn ChannelOpener>,
        target_host: &str,
        target_port: u16,
        ports: &PortAllocator,
    ) -> Result<Self, BrokerError> {
        let (listener, reservation) = ports.bind().await?;
        Ok(Self::spawn(
            listener,
            reservation,
            opener,
            target_host,
            target_port,
        ))
    }

    fn spawn<L: Accept>(
        listener: L,
        reservation: PortReservation,
        opener: Arc<dyn ChannelOpener>,
        target_host: &str,
        target_port: u16,
    ) -> Self {
        let local_port = reservation.port();
        let cancel = CancellationToken::new();

        tracing::info!(
            "Forwarding 127.0.0.1:{} to {}:{}",
            local_port,
            target_host,
            target_port
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            reservation,
            Arc::clone(&opener),
            target_host.to_string(),
            target_port,
            cancel.clone(),
        ));

        Self {
            target_host: target_host.to_string(),
            target_port,
            local_port,
            bastion: None,
            opener,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        }
    }

    /// Local port clients connect to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote `host:port` the tunnel forwards to
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// `user@host:port` of the bastion, when tunneled over SSH
    pub fn bastion(&self) -> Option<&str> {
        self.bastion.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, end every active pipe, disconnect the transport and
    /// release the local port. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::warn!(
                    "Accept loop for port {} ended abnormally: {}",
                    self.local_port,
                    e
                );
            }
        }
        self.opener.shutdown().await;

        tracing::info!("Closed tunnel on 127.0.0.1:{}", self.local_port);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs until `cancel` fires. A failed accept is retried after a short pause
/// and never touches the pairings already running.
async fn accept_loop<L: Accept>(
    listener: L,
    reservation: PortReservation,
    opener: Arc<dyn ChannelOpener>,
    target_host: String,
    target_port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    tracing::debug!("Accepted {} on port {}", origin, reservation.port());
                    tokio::spawn(forward_connection(
                        stream,
                        origin,
                        Arc::clone(&opener),
                        target_host.clone(),
                        target_port,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Accept failed on port {}: {}", reservation.port(), e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
    }

    drop(listener);
    drop(reservation);
}

async fn forward_connection(
    stream: TcpStream,
    origin: SocketAddr,
    opener: Arc<dyn ChannelOpener>,
    target_host: String,
    target_port: u16,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", origin, e);
    }

    let remote = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = opener.open(&target_host, target_port, origin) => match opened {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", origin, e);
                return;
            }
        },
    };

    match pipe(stream, remote, cancel).await {
        Ok((sent, received)) => tracing::debug!(
            "Connection from {} finished ({} bytes up, {} bytes down)",
            origin,
            sent,
            received
        ),
        Err(e) => tracing::debug!("Connection from {} ended: {}", origin, e),
    }
}
