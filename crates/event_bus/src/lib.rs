//! # Event Bus
//!
//! A lightweight message bus for the game server estate. Independently
//! deployed services (the API server, the buildplate launcher, the tappables
//! generator) talk to each other through one broker process instead of
//! point-to-point links.
//!
//! ## Pieces
//!
//! - [`Broker`]: in-memory routing core. Queue name to subscribers (fan-out
//!   publish) and queue name to request handlers (tried one by one in
//!   registration order until one answers).
//! - [`NetworkServer`]: TCP front-end exposing a broker over the line protocol
//!   in [`wire`].
//! - [`EventBusClient`]: one connection to a broker, multiplexing any number
//!   of [`Publisher`], [`Subscriber`], [`RequestSender`] and
//!   [`RequestHandler`] channels.
//!
//! ## Delivery model
//!
//! Nothing is persisted. An event reaches whoever is subscribed to exactly
//! its queue name at the moment the broker receives it. Per channel, at most
//! one publish or request is in flight; later ones queue locally and go out
//! in order.
//!
//! ## Example
//!
//! ```no_run
//! use event_bus::{Broker, EventBusClient, NetworkServer, ServerConfig, SubscriberEvent};
//!
//! # async fn example() -> Result<(), event_bus::BusError> {
//! let server = NetworkServer::bind(ServerConfig::default(), Broker::new()).await?;
//! let address = server.local_addr();
//! tokio::spawn(async move { server.run().await });
//!
//! let client = EventBusClient::connect(address).await?;
//! let _subscriber = client.add_subscriber("tappables", |event| {
//!     if let SubscriberEvent::Event(message) = event {
//!         println!("{}: {}", message.message_type, message.data);
//!     }
//! })?;
//!
//! let publisher = client.add_publisher();
//! publisher.publish("tappables", "spawn", "{\"x\":1}")?;
//! assert!(publisher.flush().await);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod server;
pub mod types;
pub mod validation;
pub mod wire;

pub use broker::{Broker, BrokerStats, HandlerHandle, SubscriberHandle};
pub use client::{
    ClientConfig, EventBusClient, PublishFuture, Publisher, RequestFuture, RequestHandler, RequestSender,
    Subscriber,
};
pub use error::BusError;
pub use server::{NetworkServer, NetworkStats, ServerConfig, DEFAULT_PORT};
pub use types::{
    current_timestamp, ChannelId, ChannelKind, ChannelState, EventMessage, RequestId, SubscriberEvent,
};
