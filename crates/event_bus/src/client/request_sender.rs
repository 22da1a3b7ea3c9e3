use super::connection::{ChannelEndpoint, ChannelLink, ClientShared};
use super::pending::{PendingQueue, RequestFuture};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, ChannelState, RequestId};
use crate::validation::validate_message;
use crate::wire::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

struct SenderState {
    queue: PendingQueue<Option<String>>,
    /// The in-flight request has been accepted by the broker
    accepted: bool,
    /// Id of the last request answered; the broker numbers requests from 1
    answered: RequestId,
}

impl SenderState {
    fn answer(&mut self, request_id: RequestId, response: Option<String>) -> Result<Option<String>, BusError> {
        if !self.accepted || request_id != self.answered + 1 {
            return Err(BusError::protocol(format!(
                "answer for request {request_id} while expecting {}",
                self.answered + 1
            )));
        }
        self.answered = request_id;
        self.accepted = false;
        self.queue
            .complete(response)
            .map_err(|_| BusError::protocol("answer with no request in flight"))
    }
}

pub(crate) struct RequestSenderChannel {
    link: ChannelLink,
    state: Mutex<SenderState>,
}

impl RequestSenderChannel {
    pub(crate) fn new(link: ChannelLink) -> Self {
        Self {
            link,
            state: Mutex::new(SenderState {
                queue: PendingQueue::new(None),
                accepted: false,
                answered: 0,
            }),
        }
    }

    fn terminate(&self, state: ChannelState) {
        if self.state.lock().queue.fail(state) {
            debug!("Request sender {} ended by broker ({:?})", self.link.id(), state);
        }
        self.link.deregister();
    }
}

impl ChannelEndpoint for RequestSenderChannel {
    const KIND: ChannelKind = ChannelKind::RequestSender;

    fn registry(client: &ClientShared) -> &DashMap<ChannelId, Arc<Self>> {
        &client.request_senders
    }

    fn on_message(self: Arc<Self>, message: ServerMessage) -> Result<(), BusError> {
        let next = match message {
            ServerMessage::Ack => {
                let mut state = self.state.lock();
                if !state.queue.has_in_flight() || state.accepted {
                    return Err(BusError::protocol("ACK with no request awaiting acceptance"));
                }
                state.accepted = true;
                None
            }
            ServerMessage::Reply { request_id, data } => self.state.lock().answer(request_id, Some(data))?,
            ServerMessage::NoReply { request_id } => self.state.lock().answer(request_id, None)?,
            ServerMessage::Error => {
                self.terminate(ChannelState::Errored);
                None
            }
            ServerMessage::Close => {
                self.terminate(ChannelState::Closed);
                None
            }
            other => return Err(BusError::protocol(format!("unexpected {other:?}"))),
        };
        if let Some(line) = next {
            self.link.send_line(line);
        }
        Ok(())
    }

    fn shut_down(&self) {
        self.state.lock().queue.fail(ChannelState::Closed);
    }

    fn fault(&self) -> bool {
        self.state.lock().queue.fail(ChannelState::Errored)
    }
}

/// Sends requests to whichever handler answers first, one request at a time.
///
/// Requests are queued locally and sent in order; the next goes out only
/// after the previous was answered. Clones share the same channel.
#[derive(Clone)]
pub struct RequestSender {
    channel: Arc<RequestSenderChannel>,
}

impl RequestSender {
    pub(crate) fn new(channel: Arc<RequestSenderChannel>) -> Self {
        Self { channel }
    }

    /// The id this sender's channel was allocated on its connection.
    pub fn channel_id(&self) -> ChannelId {
        self.channel.link.id()
    }

    /// Current lifecycle state of the channel.
    pub fn state(&self) -> ChannelState {
        self.channel.state.lock().queue.state()
    }

    /// Queues a request for the handlers of `queue`.
    ///
    /// # Arguments
    ///
    /// * `queue` - Exact queue name the handlers registered on
    /// * `message_type` - Identifier describing the payload
    /// * `data` - Printable ASCII payload, possibly empty
    ///
    /// # Returns
    ///
    /// A future resolving to the first handler response, or `None` when no
    /// handler took the request or the channel went down first.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: event_bus::EventBusClient) -> Result<(), event_bus::BusError> {
    /// let sender = client.add_request_sender();
    /// match sender.request("buildplates", "lookup", "42")?.await {
    ///     Some(reply) => println!("buildplate: {reply}"),
    ///     None => println!("nobody knows buildplate 42"),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn request(&self, queue: &str, message_type: &str, data: &str) -> Result<RequestFuture, BusError> {
        validate_message(queue, message_type, data)?;
        let line = ClientMessage::Request {
            queue: queue.to_string(),
            message_type: message_type.to_string(),
            data: data.to_string(),
        }
        .encode(self.channel.link.id());

        let mut state = self.channel.state.lock();
        let (future, send_now) = state.queue.enqueue(line);
        if let Some(line) = send_now {
            self.channel.link.send_line(line);
        }
        Ok(future)
    }

    /// Sends `request` as JSON and decodes the response as JSON.
    ///
    /// `Ok(None)` means no handler answered. A response that is not valid
    /// JSON for `R` is a [`BusError::Serialization`].
    pub async fn request_json<T, R>(&self, queue: &str, message_type: &str, request: &T) -> Result<Option<R>, BusError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let data = serde_json::to_string(request)?;
        let response = self.request(queue, message_type, &data)?.await;
        match response {
            Some(response) => Ok(Some(serde_json::from_str(&response)?)),
            None => Ok(None),
        }
    }

    /// Closes the channel. Requests still pending resolve to `None`.
    pub fn close(&self) {
        if self.channel.state.lock().queue.fail(ChannelState::Closed) {
            self.channel.link.send(&ClientMessage::Close);
            self.channel.link.deregister();
            debug!("Request sender {} closed", self.channel.link.id());
        }
    }
}

impl std::fmt::Debug for RequestSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSender")
            .field("channel_id", &self.channel_id())
            .field("state", &self.state())
            .finish()
    }
}
