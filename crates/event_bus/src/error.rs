//! Error types shared by the broker, the network front-end and the client.

use crate::types::ChannelId;

/// Errors produced by the event bus.
///
/// Producer-side failures that happen after a message was accepted locally
/// (peer `ERR`, connection loss) are not reported through this type; they
/// resolve the returned futures to `false` / `None` instead.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A queue name, message type or payload failed the charset rules.
    /// Never sent on the wire.
    #[error("Validation error: {0}")]
    Validation(String),
    /// Dialing the broker failed
    #[error("Connect error: {0}")]
    Connect(#[source] std::io::Error),
    /// Transport-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be decoded or violated the channel state machine
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The channel was closed or failed before the operation completed
    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),
    /// JSON payload encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        BusError::Protocol(message.into())
    }

    /// Returns true for errors caused by the caller's input rather than by
    /// the connection.
    pub fn is_validation(&self) -> bool {
        matches!(self, BusError::Validation(_))
    }
}
