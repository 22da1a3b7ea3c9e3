use super::connection::{ChannelEndpoint, ChannelLink, ClientShared};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, ChannelState, SubscriberEvent};
use crate::wire::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

type Listener = Box<dyn Fn(SubscriberEvent) + Send + Sync>;

pub(crate) struct SubscriberChannel {
    link: ChannelLink,
    queue: String,
    state: Mutex<ChannelState>,
    listener: Listener,
}

impl SubscriberChannel {
    pub(crate) fn new(link: ChannelLink, queue: &str, listener: Listener) -> Self {
        Self {
            link,
            queue: queue.to_string(),
            state: Mutex::new(ChannelState::Open),
            listener,
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    /// Leaves the open state. Returns false if already terminal.
    fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock();
        if !state.is_open() {
            return false;
        }
        *state = next;
        true
    }

    /// Moves to `Errored` and hands the listener its terminal event.
    fn error(&self) -> bool {
        if !self.transition(ChannelState::Errored) {
            return false;
        }
        (self.listener)(SubscriberEvent::Error);
        true
    }
}

impl ChannelEndpoint for SubscriberChannel {
    const KIND: ChannelKind = ChannelKind::Subscriber;

    fn registry(client: &ClientShared) -> &DashMap<ChannelId, Arc<Self>> {
        &client.subscribers
    }

    fn on_message(self: Arc<Self>, message: ServerMessage) -> Result<(), BusError> {
        match message {
            ServerMessage::Event(event) => {
                if self.is_open() {
                    (self.listener)(SubscriberEvent::Event(event));
                }
            }
            ServerMessage::Error | ServerMessage::Close => {
                if self.error() {
                    debug!("Subscriber {} on '{}' ended by broker", self.link.id(), self.queue);
                }
                self.link.deregister();
            }
            other => return Err(BusError::protocol(format!("unexpected {other:?}"))),
        }
        Ok(())
    }

    fn shut_down(&self) {
        self.error();
    }

    fn fault(&self) -> bool {
        self.error()
    }
}

/// A subscription to one queue.
///
/// Events are handed to the listener given to
/// [`EventBusClient::add_subscriber`](super::EventBusClient::add_subscriber).
#[derive(Clone)]
pub struct Subscriber {
    channel: Arc<SubscriberChannel>,
}

impl Subscriber {
    pub(crate) fn new(channel: Arc<SubscriberChannel>) -> Self {
        Self { channel }
    }

    /// The id this subscription's channel was allocated on its connection.
    pub fn channel_id(&self) -> ChannelId {
        self.channel.link.id()
    }

    /// The queue name this subscription listens on.
    pub fn queue(&self) -> &str {
        &self.channel.queue
    }

    /// `Errored` once the listener has been handed
    /// [`SubscriberEvent::Error`], `Closed` after [`Subscriber::close`].
    pub fn state(&self) -> ChannelState {
        *self.channel.state.lock()
    }

    /// Ends the subscription without notifying the listener.
    pub fn close(&self) {
        if self.channel.transition(ChannelState::Closed) {
            self.channel.link.send(&ClientMessage::Close);
            self.channel.link.deregister();
            debug!("Subscriber {} on '{}' closed", self.channel.link.id(), self.channel.queue);
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("channel_id", &self.channel_id())
            .field("queue", &self.queue())
            .field("state", &self.state())
            .finish()
    }
}
