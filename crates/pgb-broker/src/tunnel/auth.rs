//! SSH credential resolution for tunnels

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{Handle, Handler};
use russh_keys::key::KeyPair;

use pgb_core::{BrokerError, SshInfo};

/// Expand a leading `~` to the current user's home directory
pub fn expand_key_path(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Credentials a tunnel authenticates with, tried key first
pub struct TunnelAuth {
    user: String,
    key: Option<Arc<KeyPair>>,
    password: Option<String>,
}

impl TunnelAuth {
    /// Resolve the credentials for a bastion descriptor.
    ///
    /// An explicit key path must exist and parse. Without one, the default
    /// key is used when present. Failing to end up with any method at all is
    /// a configuration error.
    pub fn configure(info: &SshInfo, default_key_path: &Path) -> Result<Self, BrokerError> {
        let explicit = info.key_path.is_some();
        let key_path = match &info.key_path {
            Some(path) => expand_key_path(path),
            None => expand_key_path(default_key_path),
        };

        let key = if key_path.is_file() {
            let key = russh_keys::load_secret_key(&key_path, info.key_passphrase.as_deref())
                .map_err(|e| {
                    BrokerError::Configuration(format!(
                        "Failed to load private key {}: {}",
                        key_path.display(),
                        e
                    ))
                })?;
            Some(Arc::new(key))
        } else if explicit {
            return Err(BrokerError::Configuration(format!(
                "Private key not found at {}",
                key_path.display()
            )));
        } else {
            tracing::debug!("No default key at {}", key_path.display());
            None
        };

        if key.is_none() && info.password.is_none() {
            return Err(BrokerError::Configuration(format!(
                "No private key at {} and no password for {}",
                key_path.display(),
                info
            )));
        }

        Ok(Self {
            user: info.user.clone(),
            key,
            password: info.password.clone(),
        })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Authenticate an established session, key first and then password
    pub async fn authenticate<H: Handler>(
        &self,
        session: &mut Handle<H>,
    ) -> Result<(), BrokerError> {
        if let Some(key) = &self.key {
            let accepted = session
                .authenticate_publickey(&self.user, Arc::clone(key))
                .await
                .map_err(|e| BrokerError::Dial(format!("Authentication error: {}", e)))?;
            if accepted {
                return Ok(());
            }
            tracing::debug!("Public key rejected for user '{}'", self.user);
        }

        if let Some(password) = &self.password {
            let accepted = session
                .authenticate_password(&self.user, password)
                .await
                .map_err(|e| BrokerError::Dial(format!("Authentication error: {}", e)))?;
            if accepted {
                return Ok(());
            }
        }

        Err(BrokerError::Dial(format!(
            "Authentication rejected for user '{}'",
            self.user
        )))
    }
}

impl fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelAuth")
            .field("user", &self.user)
            .field("key", &self.key.is_some())
            .field("password", &self.password.is_some())
            .finish()
    }
}
