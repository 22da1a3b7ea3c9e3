//! Core value types: channel identifiers, channel kinds and event messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one logical channel within a single TCP connection.
///
/// Allocated by the client from a strictly increasing counter starting at 1
/// and never reused for the lifetime of the connection.
pub type ChannelId = u64;

/// Identifier of one outstanding request on a request channel.
pub type RequestId = u64;

/// The four kinds of channel that can be multiplexed over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Publisher,
    Subscriber,
    RequestSender,
    RequestHandler,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Publisher => "publisher",
            ChannelKind::Subscriber => "subscriber",
            ChannelKind::RequestSender => "request-sender",
            ChannelKind::RequestHandler => "request-handler",
        };
        f.write_str(name)
    }
}

/// Local lifecycle state of a channel.
///
/// `Closed` is reached through an explicit close or connection teardown on
/// the producer side; `Errored` through a peer `ERR`, a protocol violation
/// or connection teardown on the consumer side. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Open,
    Closed,
    Errored,
}

impl ChannelState {
    pub fn is_open(self) -> bool {
        self == ChannelState::Open
    }
}

/// An event as seen by subscribers and request handlers.
///
/// The timestamp is assigned by the broker when it receives the publish or
/// request, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub timestamp: u64,
    pub message_type: String,
    pub data: String,
}

impl EventMessage {
    pub fn new(timestamp: u64, message_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            timestamp,
            message_type: message_type.into(),
            data: data.into(),
        }
    }

    /// Deserializes the payload as JSON.
    pub fn data_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// What a subscriber listener is handed, in wire arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// One delivered event
    Event(EventMessage),
    /// Terminal failure; nothing further will be delivered
    Error,
}

/// Current time as milliseconds since the Unix epoch.
///
/// Falls back to 0 if the system clock reads earlier than the epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
