//! Network front-end configuration types and defaults.

use crate::wire::DEFAULT_MAX_LINE_LENGTH;
use std::net::SocketAddr;

/// Default port the broker listens on.
pub const DEFAULT_PORT: u16 = 5532;

/// Configuration for the broker's TCP front-end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the listener to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections; further connections are
    /// accepted and immediately dropped
    pub max_connections: usize,

    /// Longest accepted line, newline excluded
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 1000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}
