//! pgb-broker: Session-scoped database connections
//!
//! The broker keeps one live database connection per client session,
//! optionally routed through an SSH tunnel, and reclaims connections that
//! sit idle for too long together with their tunnels.

pub mod backend;
pub mod connection;
pub mod port;
pub mod session;
pub mod state;
pub mod tunnel;

pub use connection::{ConnectOptions, Connection};
pub use session::SessionManager;
pub use state::BrokerState;
