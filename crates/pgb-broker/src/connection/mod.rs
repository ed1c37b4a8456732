//! Per-session database connections

mod handle;
mod options;

pub use handle::{Connection, ConnectionInfo, TunnelInfo};
pub use options::ConnectOptions;
