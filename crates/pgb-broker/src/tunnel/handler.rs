//! russh client handler for tunnel sessions

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;

/// Client-side handler for a bastion session.
///
/// Tunnels only open direct-tcpip channels, so the handler has nothing to
/// do beyond host key checks.
#[derive(Debug, Clone)]
pub struct TunnelClientHandler {
    endpoint: String,
}

impl TunnelClientHandler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl client::Handler for TunnelClientHandler {
    type Error = anyhow::Error;

    /// Bastion host keys are not pinned; every key is accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.endpoint,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}
