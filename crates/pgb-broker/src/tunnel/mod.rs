//! SSH tunnels for reaching databases behind a bastion
//!
//! A [`Tunnel`] authenticates to the bastion, binds a local port from the
//! configured range and forwards every accepted connection over its own
//! direct-tcpip channel.

mod auth;
mod forwarder;
mod handler;
mod pipe;

pub use auth::{expand_key_path, TunnelAuth};
pub use forwarder::{Tunnel, TunnelOptions};
pub use handler::TunnelClientHandler;
pub use pipe::{pipe, ChannelOpener, ForwardStream, SshChannelOpener};
