use super::connection::{ChannelEndpoint, ChannelLink, ClientShared};
use super::pending::{PendingQueue, PublishFuture};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, ChannelState};
use crate::validation::validate_message;
use crate::wire::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PublisherChannel {
    link: ChannelLink,
    queue: Mutex<PendingQueue<bool>>,
}

impl PublisherChannel {
    pub(crate) fn new(link: ChannelLink) -> Self {
        Self { link, queue: Mutex::new(PendingQueue::new(false)) }
    }

    /// Broker ended the channel.
    fn terminate(&self, state: ChannelState) {
        if self.queue.lock().fail(state) {
            debug!("Publisher {} ended by broker ({:?})", self.link.id(), state);
        }
        self.link.deregister();
    }
}

impl ChannelEndpoint for PublisherChannel {
    const KIND: ChannelKind = ChannelKind::Publisher;

    fn registry(client: &ClientShared) -> &DashMap<ChannelId, Arc<Self>> {
        &client.publishers
    }

    fn on_message(self: Arc<Self>, message: ServerMessage) -> Result<(), BusError> {
        match message {
            ServerMessage::Ack => {
                let mut queue = self.queue.lock();
                match queue.complete(true) {
                    Ok(Some(next)) => self.link.send_line(next),
                    Ok(None) => {}
                    Err(()) => return Err(BusError::protocol("ACK with no publish in flight")),
                }
            }
            ServerMessage::Error => self.terminate(ChannelState::Errored),
            ServerMessage::Close => self.terminate(ChannelState::Closed),
            other => return Err(BusError::protocol(format!("unexpected {other:?}"))),
        }
        Ok(())
    }

    fn shut_down(&self) {
        self.queue.lock().fail(ChannelState::Closed);
    }

    fn fault(&self) -> bool {
        self.queue.lock().fail(ChannelState::Errored)
    }
}

/// Publishes events, one acknowledged publish at a time.
///
/// Publishes are queued locally and sent in order; the next one goes out
/// only after the broker acknowledged the previous. Clones share the same
/// channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<PublisherChannel>,
}

impl Publisher {
    pub(crate) fn new(channel: Arc<PublisherChannel>) -> Self {
        Self { channel }
    }

    /// The id this publisher's channel was allocated on its connection.
    pub fn channel_id(&self) -> ChannelId {
        self.channel.link.id()
    }

    /// Current lifecycle state. Once it leaves [`ChannelState::Open`] every
    /// publish resolves to `false` without touching the network.
    pub fn state(&self) -> ChannelState {
        self.channel.queue.lock().state()
    }

    /// Queues one event for `queue`.
    ///
    /// # Arguments
    ///
    /// * `queue` - Exact queue name subscribers listen on
    /// * `message_type` - Identifier describing the payload
    /// * `data` - Printable ASCII payload, possibly empty
    ///
    /// # Returns
    ///
    /// A future resolving to `true` once the broker acknowledged the event,
    /// whether or not anyone was subscribed, or `false` if the channel failed
    /// or closed first. Invalid input is rejected with
    /// [`BusError::Validation`] before anything is queued.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: event_bus::EventBusClient) -> Result<(), event_bus::BusError> {
    /// let publisher = client.add_publisher();
    /// let acked = publisher.publish("tappables", "spawn", "{\"x\":4}")?;
    /// if !acked.await {
    ///     eprintln!("broker did not accept the event");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn publish(&self, queue: &str, message_type: &str, data: &str) -> Result<PublishFuture, BusError> {
        validate_message(queue, message_type, data)?;
        let line = ClientMessage::Send {
            queue: queue.to_string(),
            message_type: message_type.to_string(),
            data: data.to_string(),
        }
        .encode(self.channel.link.id());

        let mut pending = self.channel.queue.lock();
        let (future, send_now) = pending.enqueue(line);
        if let Some(line) = send_now {
            self.channel.link.send_line(line);
        }
        Ok(future)
    }

    /// Publishes `value` serialized as JSON.
    ///
    /// Fails with [`BusError::Serialization`] if `value` cannot be encoded.
    pub fn publish_json<T: Serialize>(
        &self,
        queue: &str,
        message_type: &str,
        value: &T,
    ) -> Result<PublishFuture, BusError> {
        let data = serde_json::to_string(value)?;
        self.publish(queue, message_type, &data)
    }

    /// Waits for the most recently queued publish and returns its outcome.
    /// Returns `true` if nothing was ever published.
    pub async fn flush(&self) -> bool {
        let last = self.channel.queue.lock().last();
        match last {
            Some(future) => future.await,
            None => true,
        }
    }

    /// Closes the channel. Publishes still pending resolve to `false`.
    pub fn close(&self) {
        if self.channel.queue.lock().fail(ChannelState::Closed) {
            self.channel.link.send(&ClientMessage::Close);
            self.channel.link.deregister();
            debug!("Publisher {} closed", self.channel.link.id());
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("channel_id", &self.channel_id())
            .field("state", &self.state())
            .finish()
    }
}
