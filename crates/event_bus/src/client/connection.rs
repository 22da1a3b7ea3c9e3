//! The client side of one broker connection.
//!
//! A connection owns two tasks. The writer drains an unbounded FIFO of
//! pre-formatted lines onto the socket; the reader decodes incoming lines and
//! routes them by channel id to one of four registries. Either task exiting
//! stops the other. On the way out the writer closes every publisher and
//! request sender, so their pending futures resolve as failed, and the reader
//! reports an error to every subscriber and request handler.

use super::config::ClientConfig;
use super::publisher::{Publisher, PublisherChannel};
use super::request_handler::{RequestHandler, RequestHandlerChannel};
use super::request_sender::{RequestSender, RequestSenderChannel};
use super::subscriber::{Subscriber, SubscriberChannel};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, EventMessage, SubscriberEvent};
use crate::validation::validate_queue_name;
use crate::wire::{split_frame, ClientMessage, LineReader, ServerMessage};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Behaviour shared by the four client channel types, as seen by the
/// connection's reader and teardown paths.
pub(crate) trait ChannelEndpoint: Send + Sync + Sized + 'static {
    const KIND: ChannelKind;

    fn registry(client: &ClientShared) -> &DashMap<ChannelId, Arc<Self>>;

    /// Handles one decoded line. An `Err` is a protocol fault on this channel.
    fn on_message(self: Arc<Self>, message: ServerMessage) -> Result<(), BusError>;

    /// Connection teardown: producers close, consumers report an error.
    fn shut_down(&self);

    /// Local failure after a protocol fault. Returns false if the channel
    /// had already left the open state.
    fn fault(&self) -> bool;
}

struct Allocator {
    next_channel_id: ChannelId,
    reader_done: bool,
    writer_done: bool,
}

/// State shared by the client handle, its two tasks and every channel.
pub(crate) struct ClientShared {
    outgoing: mpsc::UnboundedSender<String>,
    allocator: Mutex<Allocator>,
    shutdown: watch::Sender<bool>,
    pub(crate) publishers: DashMap<ChannelId, Arc<PublisherChannel>>,
    pub(crate) subscribers: DashMap<ChannelId, Arc<SubscriberChannel>>,
    pub(crate) request_senders: DashMap<ChannelId, Arc<RequestSenderChannel>>,
    pub(crate) request_handlers: DashMap<ChannelId, Arc<RequestHandlerChannel>>,
}

impl ClientShared {
    fn send_line(&self, line: String) {
        let _ = self.outgoing.send(line);
    }

    fn deregister(&self, kind: ChannelKind, id: ChannelId) {
        match kind {
            ChannelKind::Publisher => {
                self.publishers.remove(&id);
            }
            ChannelKind::Subscriber => {
                self.subscribers.remove(&id);
            }
            ChannelKind::RequestSender => {
                self.request_senders.remove(&id);
            }
            ChannelKind::RequestHandler => {
                self.request_handlers.remove(&id);
            }
        }
    }

    fn writer_finished(&self) {
        self.allocator.lock().writer_done = true;
        self.shutdown.send_replace(true);
        let publishers = drain(&self.publishers);
        let senders = drain(&self.request_senders);
        debug!(
            "Closing {} publisher(s) and {} request sender(s)",
            publishers.len(),
            senders.len()
        );
        publishers.iter().for_each(|channel| channel.shut_down());
        senders.iter().for_each(|channel| channel.shut_down());
    }

    fn reader_finished(&self) {
        self.allocator.lock().reader_done = true;
        self.shutdown.send_replace(true);
        let subscribers = drain(&self.subscribers);
        let handlers = drain(&self.request_handlers);
        debug!(
            "Failing {} subscriber(s) and {} request handler(s)",
            subscribers.len(),
            handlers.len()
        );
        subscribers.iter().for_each(|channel| channel.shut_down());
        handlers.iter().for_each(|channel| channel.shut_down());
    }
}

/// Removes every entry, in channel id order.
fn drain<C>(registry: &DashMap<ChannelId, Arc<C>>) -> Vec<Arc<C>> {
    let mut ids: Vec<ChannelId> = registry.iter().map(|entry| *entry.key()).collect();
    ids.sort_unstable();
    ids.into_iter()
        .filter_map(|id| registry.remove(&id).map(|(_, channel)| channel))
        .collect()
}

/// A channel's way back to its connection.
pub(crate) struct ChannelLink {
    id: ChannelId,
    kind: ChannelKind,
    client: Weak<ClientShared>,
}

impl ChannelLink {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn send(&self, message: &ClientMessage) {
        self.send_line(message.encode(self.id));
    }

    pub(crate) fn send_line(&self, line: String) {
        if let Some(client) = self.client.upgrade() {
            client.send_line(line);
        }
    }

    /// Forgets the channel; later lines for its id are ignored.
    pub(crate) fn deregister(&self) {
        if let Some(client) = self.client.upgrade() {
            client.deregister(self.kind, self.id);
        }
    }
}

/// A connection to the event bus broker.
///
/// Channels are opened with the `add_*` methods. All of them are multiplexed
/// over the single TCP connection this handle owns. Dropping the handle does
/// not close the connection; call [`EventBusClient::close`].
pub struct EventBusClient {
    shared: Arc<ClientShared>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBusClient {
    /// Connects with the default [`ClientConfig`].
    pub async fn connect<A: ToSocketAddrs>(address: A) -> Result<Self, BusError> {
        Self::connect_with_config(address, ClientConfig::default()).await
    }

    /// Connects to the broker at `address`.
    ///
    /// # Arguments
    ///
    /// * `address` - Anything that resolves to the broker's socket address
    /// * `config` - Socket and framing options
    ///
    /// # Returns
    ///
    /// The connected client, with its reader and writer tasks running, or
    /// [`BusError::Connect`] if the broker could not be reached.
    pub async fn connect_with_config<A: ToSocketAddrs>(
        address: A,
        config: ClientConfig,
    ) -> Result<Self, BusError> {
        let stream = TcpStream::connect(address).await.map_err(BusError::Connect)?;
        stream.set_nodelay(config.tcp_nodelay)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        info!("🔗 Connected to event bus at {}", peer_addr);

        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            outgoing,
            allocator: Mutex::new(Allocator {
                next_channel_id: 1,
                reader_done: false,
                writer_done: false,
            }),
            shutdown,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            request_senders: DashMap::new(),
            request_handlers: DashMap::new(),
        });

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(write_loop(
            shared.clone(),
            write_half,
            outgoing_receiver,
            shared.shutdown.subscribe(),
        ));
        let reader = tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            config.max_line_length,
            shared.shutdown.subscribe(),
        ));

        Ok(Self {
            shared,
            local_addr,
            peer_addr,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Local address of the connection socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the broker this client is connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once [`EventBusClient::close`] was called or either connection
    /// task has stopped.
    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Closes the connection and waits for teardown to finish.
    ///
    /// On return every pending publish has resolved to `false`, every
    /// pending request to `None`, and every subscriber and request handler
    /// has been told about the error.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Event bus connection task ended abnormally: {}", e);
            }
        }
    }

    /// Opens a publisher channel.
    pub fn add_publisher(&self) -> Publisher {
        Publisher::new(self.open_channel(ClientMessage::OpenPublisher, PublisherChannel::new))
    }

    /// Opens a request-sender channel.
    pub fn add_request_sender(&self) -> RequestSender {
        RequestSender::new(self.open_channel(ClientMessage::OpenRequestSender, RequestSenderChannel::new))
    }

    /// Subscribes to every event published on exactly `queue`.
    ///
    /// `listener` runs on the connection's reader task, once per event in
    /// arrival order, and once more with [`SubscriberEvent::Error`] if the
    /// channel fails.
    pub fn add_subscriber<F>(&self, queue: &str, listener: F) -> Result<Subscriber, BusError>
    where
        F: Fn(SubscriberEvent) + Send + Sync + 'static,
    {
        validate_queue_name(queue)?;
        let open = ClientMessage::OpenSubscriber { queue: queue.to_string() };
        let channel = self.open_channel(open, |link| SubscriberChannel::new(link, queue, Box::new(listener)));
        Ok(Subscriber::new(channel))
    }

    /// Serves requests sent to exactly `queue`.
    ///
    /// `handler` runs as its own task per request; `Some` is sent back as the
    /// response, `None` passes the request on to the next handler. `on_error`
    /// runs once if the channel fails.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # fn example(client: &event_bus::EventBusClient) -> Result<(), event_bus::BusError> {
    /// let _echo = client.add_request_handler(
    ///     "echo",
    ///     |event: event_bus::EventMessage| async move { Some(event.data) },
    ///     || eprintln!("echo handler lost its connection"),
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_request_handler<F, Fut, E>(
        &self,
        queue: &str,
        handler: F,
        on_error: E,
    ) -> Result<RequestHandler, BusError>
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
        E: Fn() + Send + Sync + 'static,
    {
        validate_queue_name(queue)?;
        let open = ClientMessage::OpenRequestHandler { queue: queue.to_string() };
        let handler = Arc::new(move |event: EventMessage| handler(event).boxed());
        let channel = self.open_channel(open, |link| {
            RequestHandlerChannel::new(link, queue, handler, Box::new(on_error))
        });
        Ok(RequestHandler::new(channel))
    }

    /// Allocates the next id, registers the channel and queues its open
    /// line, all under the allocator lock so ids reach the wire in order.
    fn open_channel<C, B>(&self, open: ClientMessage, build: B) -> Arc<C>
    where
        C: ChannelEndpoint,
        B: FnOnce(ChannelLink) -> C,
    {
        let mut allocator = self.shared.allocator.lock();
        let id = allocator.next_channel_id;
        allocator.next_channel_id += 1;
        let channel = Arc::new(build(ChannelLink {
            id,
            kind: C::KIND,
            client: Arc::downgrade(&self.shared),
        }));

        if allocator.reader_done || allocator.writer_done {
            drop(allocator);
            debug!("Connection is closed, {} channel {} starts out failed", C::KIND, id);
            channel.shut_down();
            return channel;
        }

        C::registry(&self.shared).insert(id, channel.clone());
        self.shared.send_line(open.encode(id));
        drop(allocator);
        debug!("Opened {} channel {}", C::KIND, id);
        channel
    }
}

impl std::fmt::Debug for EventBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusClient")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Routes one line to the channel registered for its id.
fn dispatch_line(shared: &ClientShared, line: &str) -> Result<(), BusError> {
    let (id, rest) = split_frame(line)?;
    if route::<PublisherChannel>(shared, id, rest)
        || route::<SubscriberChannel>(shared, id, rest)
        || route::<RequestSenderChannel>(shared, id, rest)
        || route::<RequestHandlerChannel>(shared, id, rest)
    {
        return Ok(());
    }

    let next_channel_id = shared.allocator.lock().next_channel_id;
    if id < next_channel_id {
        debug!("Ignoring line for closed channel {}", id);
        return Ok(());
    }
    Err(BusError::protocol(format!("line for unallocated channel {id}: {rest:?}")))
}

fn route<C: ChannelEndpoint>(shared: &ClientShared, id: ChannelId, rest: &str) -> bool {
    let channel = match C::registry(shared).get(&id) {
        Some(entry) => entry.value().clone(),
        None => return false,
    };
    let outcome = ServerMessage::decode(C::KIND, rest).and_then(|message| channel.clone().on_message(message));
    if let Err(e) = outcome {
        warn!("Protocol fault on {} channel {}: {}", C::KIND, id, e);
        if channel.fault() {
            shared.send_line(ClientMessage::Close.encode(id));
        }
        shared.deregister(C::KIND, id);
    }
    true
}

async fn write_loop(
    shared: Arc<ClientShared>,
    write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut writer = BufWriter::new(write_half);
    let outcome: Result<(), BusError> = async {
        loop {
            let line = tokio::select! {
                line = receiver.recv() => line,
                _ = shutdown.changed() => return Ok(()),
            };
            let Some(line) = line else { return Ok(()) };
            trace!("➡️ {}", line.trim_end());
            writer.write_all(line.as_bytes()).await?;
            if receiver.is_empty() {
                writer.flush().await?;
            }
        }
    }
    .await;

    if let Err(e) = outcome {
        warn!("Event bus connection write failed: {}", e);
    }
    let _ = writer.shutdown().await;
    shared.writer_finished();
}

async fn read_loop(
    shared: Arc<ClientShared>,
    read_half: OwnedReadHalf,
    max_line_length: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = LineReader::new(read_half, max_line_length);
    let outcome: Result<(), BusError> = loop {
        let line = tokio::select! {
            line = reader.next_line() => line,
            _ = shutdown.changed() => break Ok(()),
        };
        match line {
            Ok(Some(line)) => {
                trace!("⬅️ {}", line);
                if let Err(e) = dispatch_line(&shared, &line) {
                    break Err(e);
                }
            }
            Ok(None) => {
                info!("Event bus broker closed the connection");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = outcome {
        warn!("Event bus connection failed: {}", e);
    }
    shared.reader_finished();
}
