//! Client library: one [`EventBusClient`] per broker connection and the four
//! channel types multiplexed over it.

mod config;
mod connection;
mod pending;
mod publisher;
mod request_handler;
mod request_sender;
mod subscriber;

pub use config::ClientConfig;
pub use connection::EventBusClient;
pub use pending::{PublishFuture, RequestFuture};
pub use publisher::Publisher;
pub use request_handler::RequestHandler;
pub use request_sender::RequestSender;
pub use subscriber::Subscriber;
