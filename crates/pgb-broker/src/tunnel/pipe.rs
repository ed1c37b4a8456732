//! Channel opening and byte piping for forwarded connections

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use pgb_core::BrokerError;

use super::handler::TunnelClientHandler;

/// Bidirectional byte stream carried to the remote target
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// Opens streams to the tunnel target on behalf of accepted local connections
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    /// Open a stream to `target_host:target_port`, tagged with the local origin
    async fn open(
        &self,
        target_host: &str,
        target_port: u16,
        origin: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, BrokerError>;

    /// Tear down the underlying transport
    async fn shutdown(&self);
}

/// Authenticated SSH session opening direct-tcpip channels
pub struct SshChannelOpener {
    session: Handle<TunnelClientHandler>,
}

impl SshChannelOpener {
    pub fn new(session: Handle<TunnelClientHandler>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ChannelOpener for SshChannelOpener {
    async fn open(
        &self,
        target_host: &str,
        target_port: u16,
        origin: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, BrokerError> {
        let channel = self
            .session
            .channel_open_direct_tcpip(
                target_host,
                u32::from(target_port),
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
            .map_err(|e| {
                BrokerError::Dial(format!(
                    "Failed to open channel to {}:{}: {}",
                    target_host, target_port, e
                ))
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn shutdown(&self) {
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            tracing::debug!("SSH disconnect: {}", e);
        }
    }
}

/// Copy bytes both ways until both sides finish, an error occurs, or
/// `cancel` fires.
///
/// EOF on one side is forwarded as a write shutdown to the other. Returns
/// the byte counts `(local -> remote, remote -> local)`.
pub async fn pipe<L, R>(
    mut local: L,
    mut remote: R,
    cancel: CancellationToken,
) -> io::Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut local, &mut remote) => result,
        _ = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "tunnel closed",
        )),
    }
}
