//! The broker's TCP front-end.

use super::config::ServerConfig;
use super::connection::Connection;
use crate::broker::Broker;
use crate::error::BusError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Connection counters for a [`NetworkServer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
}

/// Holds one slot of the connection limit; released on drop, including
/// when a connection task panics.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::AcqRel);
        let slot = Self { active: active.clone() };
        (previous < limit).then_some(slot)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accepts TCP connections and binds each one to the shared [`Broker`].
///
/// Every accepted connection gets its own reader loop and writer task. The
/// broker's registries are the only state shared between connections.
pub struct NetworkServer {
    config: ServerConfig,
    broker: Broker,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_sender: watch::Sender<bool>,
    active_connections: Arc<AtomicUsize>,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl NetworkServer {
    /// Binds the listener described by `config`.
    ///
    /// Binding to port 0 picks a free port; see [`NetworkServer::local_addr`].
    pub async fn bind(config: ServerConfig, broker: Broker) -> Result<Self, BusError> {
        let domain = if config.bind_address.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&config.bind_address.into())?;
        socket.listen(1024)?;

        let std_listener: StdTcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        info!("✅ Event bus listening on {}", local_addr);

        let (shutdown_sender, _) = watch::channel(false);
        Ok(Self {
            config,
            broker,
            listener,
            local_addr,
            shutdown_sender,
            active_connections: Arc::new(AtomicUsize::new(0)),
            total_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
        }
    }

    /// Asks the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown_sender.send_replace(true);
    }

    /// Runs the accept loop until [`NetworkServer::shutdown`] is called.
    pub async fn run(&self) -> Result<(), BusError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        if *shutdown_receiver.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_receiver.changed() => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let Some(slot) = ConnectionSlot::acquire(&self.active_connections, self.config.max_connections) else {
            self.rejected_connections.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rejecting connection from {}: limit of {} connections reached",
                addr, self.config.max_connections
            );
            return;
        };
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let connection = Connection::new(addr, self.broker.clone(), self.config.max_line_length);
        let shutdown_receiver = self.shutdown_sender.subscribe();
        tokio::spawn(async move {
            let _slot = slot;
            connection.run(stream, shutdown_receiver).await;
        });
    }
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slots_respect_limit_and_release_on_drop() {
        let active = Arc::new(AtomicUsize::new(0));

        let first = ConnectionSlot::acquire(&active, 2).unwrap();
        let second = ConnectionSlot::acquire(&active, 2).unwrap();
        assert!(ConnectionSlot::acquire(&active, 2).is_none());
        assert_eq!(active.load(Ordering::SeqCst), 2);

        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        let third = ConnectionSlot::acquire(&active, 2);
        assert!(third.is_some());

        drop(second);
        drop(third);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slot_is_released_when_connection_task_panics() {
        let active = Arc::new(AtomicUsize::new(0));
        let slot = ConnectionSlot::acquire(&active, 1).unwrap();

        let task = tokio::spawn(async move {
            let _slot = slot;
            panic!("connection task failed");
        });
        assert!(task.await.is_err());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
