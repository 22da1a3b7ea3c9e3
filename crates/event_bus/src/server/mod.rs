//! TCP front-end binding client connections to a [`Broker`](crate::broker::Broker).

mod config;
mod connection;
mod core;

pub use self::config::{ServerConfig, DEFAULT_PORT};
pub use self::core::{NetworkServer, NetworkStats};
