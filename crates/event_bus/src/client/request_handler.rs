use super::connection::{ChannelEndpoint, ChannelLink, ClientShared};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, ChannelState, EventMessage, RequestId};
use crate::validation::is_valid_data;
use crate::wire::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) type ServeFn = Arc<dyn Fn(EventMessage) -> BoxFuture<'static, Option<String>> + Send + Sync>;
type ErrorCallback = Box<dyn Fn() + Send + Sync>;

pub(crate) struct RequestHandlerChannel {
    link: ChannelLink,
    queue: String,
    state: Mutex<ChannelState>,
    serve: ServeFn,
    on_error: ErrorCallback,
}

impl RequestHandlerChannel {
    pub(crate) fn new(link: ChannelLink, queue: &str, serve: ServeFn, on_error: ErrorCallback) -> Self {
        Self {
            link,
            queue: queue.to_string(),
            state: Mutex::new(ChannelState::Open),
            serve,
            on_error,
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock();
        if !state.is_open() {
            return false;
        }
        *state = next;
        true
    }

    fn error(&self) -> bool {
        if !self.transition(ChannelState::Errored) {
            return false;
        }
        (self.on_error)();
        true
    }

    /// Runs the handler for one request and sends back its answer.
    async fn answer(self: Arc<Self>, request_id: RequestId, event: EventMessage) {
        let response = (self.serve)(event).await;
        if !self.is_open() {
            debug!("Request handler {} closed before request {} was answered", self.link.id(), request_id);
            return;
        }
        let answer = match response {
            Some(data) if is_valid_data(&data) => ClientMessage::Reply { request_id, data },
            Some(_) => {
                warn!(
                    "Request handler {} on '{}' produced a response that cannot be sent; answering NREP",
                    self.link.id(),
                    self.queue
                );
                ClientMessage::NoReply { request_id }
            }
            None => ClientMessage::NoReply { request_id },
        };
        self.link.send(&answer);
    }
}

impl ChannelEndpoint for RequestHandlerChannel {
    const KIND: ChannelKind = ChannelKind::RequestHandler;

    fn registry(client: &ClientShared) -> &DashMap<ChannelId, Arc<Self>> {
        &client.request_handlers
    }

    fn on_message(self: Arc<Self>, message: ServerMessage) -> Result<(), BusError> {
        match message {
            ServerMessage::Request { request_id, event } => {
                if self.is_open() {
                    tokio::spawn(self.answer(request_id, event));
                }
            }
            ServerMessage::Error | ServerMessage::Close => {
                if self.error() {
                    debug!("Request handler {} on '{}' ended by broker", self.link.id(), self.queue);
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

/// A registration serving requests for one queue.
///
/// The broker offers each request to the handlers of a queue one at a time,
/// in registration order; answering `None` passes it on to the next one.
#[derive(Clone)]
pub struct RequestHandler {
    channel: Arc<RequestHandlerChannel>,
}

impl RequestHandler {
    pub(crate) fn new(channel: Arc<RequestHandlerChannel>) -> Self {
        Self { channel }
    }

    /// The id this handler's channel was allocated on its connection.
    pub fn channel_id(&self) -> ChannelId {
        self.channel.link.id()
    }

    /// The queue name this handler serves.
    pub fn queue(&self) -> &str {
        &self.channel.queue
    }

    /// Current lifecycle state of the channel.
    pub fn state(&self) -> ChannelState {
        *self.channel.state.lock()
    }

    /// Stops serving. Requests still being handled are not answered, and the
    /// error callback is not invoked.
    pub fn close(&self) {
        if self.channel.transition(ChannelState::Closed) {
            self.channel.link.send(&ClientMessage::Close);
            self.channel.link.deregister();
            debug!("Request handler {} on '{}' closed", self.channel.link.id(), self.channel.queue);
        }
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("channel_id", &self.channel_id())
            .field("queue", &self.queue())
            .field("state", &self.state())
            .finish()
    }
}
