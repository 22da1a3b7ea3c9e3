//! One accepted client connection: reader loop, writer task and the table of
//! channels the client has opened.

use crate::broker::{Broker, HandlerHandle, SubscriberHandle};
use crate::error::BusError;
use crate::types::{current_timestamp, ChannelId, ChannelKind, EventMessage, RequestId};
use crate::validation::{validate_message, validate_queue_name};
use crate::wire::{split_frame, ClientMessage, LineReader, ServerMessage};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// How long the writer may take to flush queued lines once the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue of fully formatted outgoing lines, drained by the writer task.
type Outgoing = mpsc::UnboundedSender<String>;

fn send_line(outgoing: &Outgoing, line: String) {
    // A closed queue means the writer is gone; the reader loop notices the
    // dead socket on its own.
    let _ = outgoing.send(line);
}

/// Broker-side state of a request-handler channel, shared with the handler
/// function registered in the broker.
struct HandlerChannel {
    channel_id: ChannelId,
    outgoing: Outgoing,
    open: AtomicBool,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Option<String>>>>,
}

impl HandlerChannel {
    fn new(channel_id: ChannelId, outgoing: Outgoing) -> Self {
        Self {
            channel_id,
            outgoing,
            open: AtomicBool::new(true),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards one request to the client and waits for its answer.
    async fn dispatch(self: Arc<Self>, event: EventMessage) -> Result<Option<String>, BusError> {
        let (sender, receiver) = oneshot::channel();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            // Checked under the pending lock so close() cannot miss this entry.
            if !self.open.load(Ordering::Acquire) {
                return Err(BusError::ChannelClosed(self.channel_id));
            }
            pending.insert(request_id, sender);
        }
        let line = ServerMessage::Request { request_id, event }.encode(self.channel_id);
        if self.outgoing.send(line).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(BusError::ChannelClosed(self.channel_id));
        }
        receiver.await.map_err(|_| BusError::ChannelClosed(self.channel_id))
    }

    /// Resolves an outstanding request. Returns false for an unknown id.
    fn complete(&self, request_id: RequestId, response: Option<String>) -> bool {
        match self.pending.lock().remove(&request_id) {
            Some(sender) => {
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Stops accepting requests and fails every outstanding one. Returns
    /// false if the channel was already closed.
    fn close(&self) -> bool {
        let mut pending = self.pending.lock();
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        // Dropping the senders resolves the waiting dispatches with an error.
        pending.clear();
        true
    }
}

enum ServerChannel {
    Publisher,
    Subscriber(SubscriberHandle),
    RequestSender { next_request_id: RequestId },
    RequestHandler { handle: HandlerHandle, shared: Arc<HandlerChannel> },
}

impl ServerChannel {
    fn kind(&self) -> ChannelKind {
        match self {
            ServerChannel::Publisher => ChannelKind::Publisher,
            ServerChannel::Subscriber(_) => ChannelKind::Subscriber,
            ServerChannel::RequestSender { .. } => ChannelKind::RequestSender,
            ServerChannel::RequestHandler { .. } => ChannelKind::RequestHandler,
        }
    }

    /// Detaches the channel from the broker.
    fn teardown(self) {
        match self {
            ServerChannel::Subscriber(handle) => handle.remove(),
            ServerChannel::RequestHandler { handle, shared } => {
                handle.remove();
                shared.close();
            }
            ServerChannel::Publisher | ServerChannel::RequestSender { .. } => {}
        }
    }
}

/// Per-connection state. Owned by the connection's reader loop; only the
/// outgoing queue is shared with broker callbacks.
pub(crate) struct Connection {
    id: Uuid,
    remote_addr: SocketAddr,
    broker: Broker,
    max_line_length: usize,
    outgoing: Outgoing,
    outgoing_receiver: Option<mpsc::UnboundedReceiver<String>>,
    channels: HashMap<ChannelId, ServerChannel>,
    /// Lowest id a newly opened channel may use
    next_channel_id: ChannelId,
}

impl Connection {
    pub(crate) fn new(remote_addr: SocketAddr, broker: Broker, max_line_length: usize) -> Self {
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            broker,
            max_line_length,
            outgoing,
            outgoing_receiver: Some(outgoing_receiver),
            channels: HashMap::new(),
            next_channel_id: 1,
        }
    }

    /// Serves the connection until the peer disconnects, a connection-fatal
    /// protocol error occurs, or shutdown is requested.
    pub(crate) async fn run(mut self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        info!("🔗 Connection {} opened from {}", self.id, self.remote_addr);
        let (read_half, write_half) = stream.into_split();
        let (finish, finished) = oneshot::channel();
        let mut writer = match self.outgoing_receiver.take() {
            Some(receiver) => tokio::spawn(write_loop(self.id, write_half, receiver, finished)),
            None => return,
        };

        let mut reader = LineReader::new(read_half, self.max_line_length);
        let outcome = loop {
            let line = tokio::select! {
                line = reader.next_line() => line,
                _ = shutdown.changed() => break Ok(()),
            };
            match line {
                Ok(Some(line)) => {
                    trace!("⬅️ [{}] {}", self.id, line);
                    if let Err(e) = self.handle_line(&line).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => info!("🔌 Connection {} from {} closed", self.id, self.remote_addr),
            Err(e) => warn!("🔌 Connection {} from {} dropped: {}", self.id, self.remote_addr, e),
        }

        self.teardown_channels();

        // Lines queued before this point still reach the socket.
        let _ = finish.send(());
        if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            warn!("Connection {}: writer did not drain within {:?}", self.id, WRITER_DRAIN_TIMEOUT);
            writer.abort();
        }
    }

    fn teardown_channels(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        let open_channels = self.channels.len();
        for (_, channel) in self.channels.drain() {
            channel.teardown();
        }
        debug!("Connection {} tore down {} channel(s)", self.id, open_channels);
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), BusError> {
        let (channel_id, rest) = split_frame(line)?;

        if let Some(kind) = self.channels.get(&channel_id).map(ServerChannel::kind) {
            match ClientMessage::decode(rest) {
                Ok(message) => self.handle_channel_message(channel_id, kind, message).await,
                Err(e) => {
                    warn!("Connection {}: {} channel {}: {}", self.id, kind, channel_id, e);
                    self.fail_channel(channel_id);
                }
            }
            return Ok(());
        }

        if channel_id < self.next_channel_id {
            debug!("Connection {}: ignoring line for expired channel {}", self.id, channel_id);
            return Ok(());
        }

        let message = ClientMessage::decode(rest)?;
        if message.opens().is_none() {
            return Err(BusError::protocol(format!(
                "command for unknown channel {channel_id}: {rest:?}"
            )));
        }
        self.next_channel_id = channel_id
            .checked_add(1)
            .ok_or_else(|| BusError::protocol(format!("channel id {channel_id} leaves no room for another")))?;
        self.open_channel(channel_id, message).await;
        Ok(())
    }

    async fn open_channel(&mut self, channel_id: ChannelId, message: ClientMessage) {
        let channel = match message {
            ClientMessage::OpenPublisher => ServerChannel::Publisher,
            ClientMessage::OpenRequestSender => ServerChannel::RequestSender { next_request_id: 1 },
            ClientMessage::OpenSubscriber { queue } => {
                let outgoing = self.outgoing.clone();
                let deliver = move |event: &EventMessage| {
                    send_line(&outgoing, ServerMessage::Event(event.clone()).encode(channel_id));
                };
                match self.broker.add_subscriber(&queue, deliver).await {
                    Ok(handle) => ServerChannel::Subscriber(handle),
                    Err(e) => {
                        warn!("Connection {}: rejecting subscriber {}: {}", self.id, channel_id, e);
                        self.send(ServerMessage::Error, channel_id);
                        return;
                    }
                }
            }
            ClientMessage::OpenRequestHandler { queue } => {
                if let Err(e) = validate_queue_name(&queue) {
                    warn!("Connection {}: rejecting request handler {}: {}", self.id, channel_id, e);
                    self.send(ServerMessage::Error, channel_id);
                    return;
                }
                let shared = Arc::new(HandlerChannel::new(channel_id, self.outgoing.clone()));
                let dispatch_target = shared.clone();
                let failed = shared.clone();
                let connection_id = self.id;
                let registration = self
                    .broker
                    .add_request_handler(
                        &queue,
                        move |event| dispatch_target.clone().dispatch(event).boxed(),
                        move |error| {
                            debug!(
                                "Connection {}: request handler {} gave up on a request: {}",
                                connection_id, failed.channel_id, error
                            );
                        },
                    )
                    .await;
                match registration {
                    Ok(handle) => ServerChannel::RequestHandler { handle, shared },
                    Err(e) => {
                        warn!("Connection {}: rejecting request handler {}: {}", self.id, channel_id, e);
                        self.send(ServerMessage::Error, channel_id);
                        return;
                    }
                }
            }
            _ => return,
        };
        debug!("Connection {}: opened {} channel {}", self.id, channel.kind(), channel_id);
        self.channels.insert(channel_id, channel);
    }

    async fn handle_channel_message(&mut self, channel_id: ChannelId, kind: ChannelKind, message: ClientMessage) {
        match (kind, message) {
            (_, ClientMessage::Close) => {
                if let Some(channel) = self.channels.remove(&channel_id) {
                    channel.teardown();
                    debug!("Connection {}: closed {} channel {}", self.id, kind, channel_id);
                }
            }
            (ChannelKind::Publisher, ClientMessage::Send { queue, message_type, data }) => {
                match self.broker.publish(&queue, current_timestamp(), &message_type, &data).await {
                    Ok(_) => self.send(ServerMessage::Ack, channel_id),
                    Err(e) => {
                        warn!("Connection {}: publish on channel {} rejected: {}", self.id, channel_id, e);
                        self.fail_channel(channel_id);
                    }
                }
            }
            (ChannelKind::RequestSender, ClientMessage::Request { queue, message_type, data }) => {
                if let Err(e) = validate_message(&queue, &message_type, &data) {
                    warn!("Connection {}: request on channel {} rejected: {}", self.id, channel_id, e);
                    self.fail_channel(channel_id);
                    return;
                }
                let request_id = match self.channels.get_mut(&channel_id) {
                    Some(ServerChannel::RequestSender { next_request_id }) => {
                        let id = *next_request_id;
                        *next_request_id += 1;
                        id
                    }
                    _ => return,
                };
                self.send(ServerMessage::Ack, channel_id);

                let broker = self.broker.clone();
                let outgoing = self.outgoing.clone();
                let timestamp = current_timestamp();
                tokio::spawn(async move {
                    let reply = match broker.request(&queue, timestamp, &message_type, &data).await {
                        Ok(Some(data)) => ServerMessage::Reply { request_id, data },
                        Ok(None) | Err(_) => ServerMessage::NoReply { request_id },
                    };
                    send_line(&outgoing, reply.encode(channel_id));
                });
            }
            (ChannelKind::RequestHandler, ClientMessage::Reply { request_id, data }) => {
                self.complete_request(channel_id, request_id, Some(data));
            }
            (ChannelKind::RequestHandler, ClientMessage::NoReply { request_id }) => {
                self.complete_request(channel_id, request_id, None);
            }
            (kind, message) => {
                warn!(
                    "Connection {}: {:?} is not valid on {} channel {}",
                    self.id, message, kind, channel_id
                );
                self.fail_channel(channel_id);
            }
        }
    }

    fn complete_request(&mut self, channel_id: ChannelId, request_id: RequestId, response: Option<String>) {
        let completed = match self.channels.get(&channel_id) {
            Some(ServerChannel::RequestHandler { shared, .. }) => shared.complete(request_id, response),
            _ => false,
        };
        if !completed {
            warn!(
                "Connection {}: answer for unknown request {} on channel {}",
                self.id, request_id, channel_id
            );
            self.fail_channel(channel_id);
        }
    }

    /// Tears a channel down after a protocol fault and tells the client.
    fn fail_channel(&mut self, channel_id: ChannelId) {
        if let Some(channel) = self.channels.remove(&channel_id) {
            channel.teardown();
        }
        self.send(ServerMessage::Error, channel_id);
    }

    fn send(&self, message: ServerMessage, channel_id: ChannelId) {
        send_line(&self.outgoing, message.encode(channel_id));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Also reached when the reader loop unwinds.
        self.teardown_channels();
    }
}

/// Writes queued lines until `finish` fires, then writes whatever is still
/// queued and shuts the socket's write side down.
async fn write_loop(
    connection_id: Uuid,
    write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<String>,
    mut finish: oneshot::Receiver<()>,
) {
    let mut writer = BufWriter::new(write_half);
    let outcome: std::io::Result<()> = async {
        loop {
            let line = tokio::select! {
                biased;
                line = receiver.recv() => line,
                _ = &mut finish => break,
            };
            let Some(line) = line else { break };
            writer.write_all(line.as_bytes()).await?;
            if receiver.is_empty() {
                writer.flush().await?;
            }
        }
        while let Ok(line) = receiver.try_recv() {
            writer.write_all(line.as_bytes()).await?;
        }
        writer.flush().await?;
        writer.shutdown().await
    }
    .await;

    if let Err(e) = outcome {
        debug!("Connection {}: write failed: {}", connection_id, e);
    }
}
