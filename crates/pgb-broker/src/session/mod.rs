//! Session management

mod cleanup;
mod manager;

pub use cleanup::DEFAULT_CLEANUP_INTERVAL;
pub use manager::SessionManager;
