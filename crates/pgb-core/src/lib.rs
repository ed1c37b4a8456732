//! pgb-core: Core types and configuration for pgbroker
//!
//! This crate provides the shared error taxonomy, configuration structures,
//! clock abstraction and connection-string helpers used by the broker.

pub mod config;
pub mod conn_string;
pub mod error;
pub mod time;
pub mod types;

pub use error::{BrokerError, ConnectivityError, ConnectivityReason};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{HistoryRecord, SessionId, SshInfo};
