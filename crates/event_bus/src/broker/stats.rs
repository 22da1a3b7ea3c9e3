use serde::{Deserialize, Serialize};

/// Point-in-time counters for a [`Broker`](super::Broker).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Queues with at least one subscriber entry
    pub subscriber_queues: usize,
    pub active_subscribers: usize,
    /// Queues with at least one request handler entry
    pub handler_queues: usize,
    pub active_handlers: usize,
    pub events_published: u64,
    /// Sum of per-publish fan-out counts
    pub events_delivered: u64,
    pub requests_dispatched: u64,
    /// Requests that resolved to "no handler produced a result"
    pub requests_unhandled: u64,
}
