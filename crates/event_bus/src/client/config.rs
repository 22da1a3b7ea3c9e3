use crate::wire::DEFAULT_MAX_LINE_LENGTH;

/// Connection options for [`EventBusClient`](super::EventBusClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Longest line accepted from the broker, newline excluded
    pub max_line_length: usize,
    /// Disable Nagle's algorithm on the connection socket
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            tcp_nodelay: true,
        }
    }
}
