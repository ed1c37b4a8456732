//! Core error types for pgbroker

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for session, connection and tunnel operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Bad credentials setup: unreadable key, missing key, nothing to authenticate with
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// SSH host or database backend unreachable
    #[error("Dial error: {0}")]
    Dial(String),

    /// Liveness probe failed
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    /// No free local port in the scanned range
    #[error("No available port in range {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    /// Operation on a connection that was already closed
    #[error("Connection already closed")]
    AlreadyClosed,

    /// Backend query failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Connection URL could not be parsed or has an unsupported scheme
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a liveness probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityReason {
    /// Server actively refused the connection
    Refused,
    /// Credentials were rejected
    AuthFailed,
    /// The requested database does not exist
    DatabaseMissing,
    /// Anything else
    Other,
}

impl fmt::Display for ConnectivityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityReason::Refused => write!(f, "connection refused"),
            ConnectivityReason::AuthFailed => write!(f, "authentication failed"),
            ConnectivityReason::DatabaseMissing => write!(f, "database does not exist"),
            ConnectivityReason::Other => write!(f, "probe failed"),
        }
    }
}

/// A failed liveness probe, classified from the backend's error message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct ConnectivityError {
    pub reason: ConnectivityReason,
    pub message: String,
}

impl ConnectivityError {
    /// Classify a raw backend error message
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let reason = if lower.contains("connection refused") || lower.contains("actively refused")
        {
            ConnectivityReason::Refused
        } else if lower.contains("authentication failed") {
            ConnectivityReason::AuthFailed
        } else if lower.contains("database") && lower.contains("does not exist") {
            ConnectivityReason::DatabaseMissing
        } else {
            ConnectivityReason::Other
        };

        Self { reason, message }
    }
}

/// Configuration-file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
