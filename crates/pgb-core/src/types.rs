//! Core domain types

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;

/// Default SSH port used when a tunnel descriptor omits one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Opaque client-chosen session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Describes the SSH bastion a tunneled connection goes through
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SshInfo {
    /// Bastion hostname or IP
    pub host: String,

    /// Bastion SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub user: String,

    /// Password authentication, tried after the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Private key path; `~` is expanded. Falls back to the configured default key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl SshInfo {
    /// Create a descriptor with no credentials attached
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            ..Default::default()
        }
    }

    /// Attach a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Attach a private key path
    pub fn with_key(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.key_path = Some(path.into());
        self.key_passphrase = passphrase;
        self
    }

    /// `host:port` of the bastion
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SshInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

// Secrets stay out of logs
impl fmt::Debug for SshInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A successfully executed query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Query text as submitted
    pub query: String,
    /// Completion time, Unix milliseconds
    pub timestamp: u64,
}

impl HistoryRecord {
    pub fn new(query: impl Into<String>, timestamp: u64) -> Self {
        Self {
            query: query.into(),
            timestamp,
        }
    }
}
