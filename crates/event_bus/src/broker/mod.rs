//! Broker core: in-memory routing registries with no network code.
//!
//! The broker keeps two registries keyed by exact queue name:
//!
//! * **subscribers** receive every event published to their queue (fan-out)
//! * **request handlers** are tried one after another, in registration order,
//!   until one of them produces a response
//!
//! Both registries sit behind a read-write lock. Publishes and request
//! dispatches share the read side, registration takes the write side.
//! Removing a registration deactivates it immediately and leaves the physical
//! removal to a background task, so a subscriber may remove itself from inside
//! its own delivery callback without deadlocking on the lock held by the
//! publish that is calling it.

mod handles;
mod stats;

pub use handles::{HandlerHandle, SubscriberHandle};
pub use stats::BrokerStats;

use crate::error::BusError;
use crate::types::EventMessage;
use crate::validation::{validate_data, validate_message, validate_queue_name};
use futures::future::BoxFuture;
use handles::{HandlerEntry, SubscriberEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// Callback invoked synchronously for every event delivered to a subscriber.
pub type DeliverFn = Arc<dyn Fn(&EventMessage) + Send + Sync>;

/// Asynchronous request handler. `Ok(None)` means "not handled here, try the
/// next handler".
pub type HandlerFn =
    Arc<dyn Fn(EventMessage) -> BoxFuture<'static, Result<Option<String>, BusError>> + Send + Sync>;

/// Invoked when a handler function fails. The failed handler counts as not
/// having handled the request.
pub type HandlerErrorFn = Arc<dyn Fn(&BusError) + Send + Sync>;

pub(crate) struct BrokerInner {
    pub(crate) subscribers: RwLock<HashMap<String, Vec<Arc<SubscriberEntry>>>>,
    pub(crate) handlers: RwLock<HashMap<String, Vec<Arc<HandlerEntry>>>>,
    next_registration_id: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    requests_dispatched: AtomicU64,
    requests_unhandled: AtomicU64,
}

/// The shared routing core. Cheap to clone; all clones share registries.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscribers", &"[registry]")
            .field("handlers", &"[registry]")
            .finish()
    }
}

impl Broker {
    /// Creates a broker with empty registries.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                next_registration_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                events_delivered: AtomicU64::new(0),
                requests_dispatched: AtomicU64::new(0),
                requests_unhandled: AtomicU64::new(0),
            }),
        }
    }

    fn next_registration_id(&self) -> u64 {
        self.inner.next_registration_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a subscriber for exactly `queue`.
    ///
    /// Fails with [`BusError::Validation`] if the queue name is invalid.
    pub async fn add_subscriber<F>(&self, queue: &str, deliver: F) -> Result<SubscriberHandle, BusError>
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        validate_queue_name(queue)?;
        let entry = Arc::new(SubscriberEntry::new(self.next_registration_id(), Arc::new(deliver)));
        self.inner
            .subscribers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(entry.clone());
        debug!("➕ Subscriber {} registered on queue '{}'", entry.id, queue);
        Ok(SubscriberHandle::new(queue.to_string(), entry, self.inner.clone()))
    }

    /// Registers a request handler for exactly `queue`. Handlers for the same
    /// queue are tried in registration order.
    pub async fn add_request_handler<F, E>(
        &self,
        queue: &str,
        handler: F,
        on_error: E,
    ) -> Result<HandlerHandle, BusError>
    where
        F: Fn(EventMessage) -> BoxFuture<'static, Result<Option<String>, BusError>> + Send + Sync + 'static,
        E: Fn(&BusError) + Send + Sync + 'static,
    {
        validate_queue_name(queue)?;
        let entry = Arc::new(HandlerEntry::new(
            self.next_registration_id(),
            Arc::new(handler),
            Arc::new(on_error),
        ));
        self.inner
            .handlers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(entry.clone());
        debug!("➕ Request handler {} registered on queue '{}'", entry.id, queue);
        Ok(HandlerHandle::new(queue.to_string(), entry, self.inner.clone()))
    }

    /// Delivers one event to every active subscriber of `queue`.
    ///
    /// Delivery happens synchronously while the read lock is held. An event
    /// with no subscribers is dropped. The returned count is informational;
    /// only an invalid message is an error.
    pub async fn publish(
        &self,
        queue: &str,
        timestamp: u64,
        message_type: &str,
        data: &str,
    ) -> Result<usize, BusError> {
        validate_message(queue, message_type, data)?;
        let message = EventMessage::new(timestamp, message_type, data);

        let subscribers = self.inner.subscribers.read().await;
        let mut delivered = 0;
        if let Some(entries) = subscribers.get(queue) {
            for entry in entries.iter().filter(|entry| entry.is_active()) {
                (entry.deliver)(&message);
                delivered += 1;
            }
        }
        drop(subscribers);

        self.inner.events_published.fetch_add(1, Ordering::Relaxed);
        self.inner
            .events_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        trace!("📤 Published '{}' on '{}' to {} subscriber(s)", message_type, queue, delivered);
        Ok(delivered)
    }

    /// Dispatches a request to the handlers registered for `queue`.
    ///
    /// The handler set is snapshotted under the read lock, then each handler
    /// is awaited in turn. The first `Some` response wins and the remaining
    /// handlers are not invoked. Zero handlers, or every handler answering
    /// `None`, resolves to `None`.
    pub async fn request(
        &self,
        queue: &str,
        timestamp: u64,
        message_type: &str,
        data: &str,
    ) -> Result<Option<String>, BusError> {
        validate_message(queue, message_type, data)?;
        self.inner.requests_dispatched.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Arc<HandlerEntry>> = {
            let handlers = self.inner.handlers.read().await;
            handlers
                .get(queue)
                .map(|entries| entries.iter().filter(|e| e.is_active()).cloned().collect())
                .unwrap_or_default()
        };

        let message = EventMessage::new(timestamp, message_type, data);
        for entry in snapshot {
            if !entry.is_active() {
                continue;
            }
            match (entry.handler)(message.clone()).await {
                Ok(Some(response)) => match validate_data(&response) {
                    Ok(()) => return Ok(Some(response)),
                    Err(e) => {
                        warn!("Request handler {} on '{}' produced an unsendable response", entry.id, queue);
                        (entry.on_error)(&e);
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("Request handler {} on '{}' failed: {}", entry.id, queue, e);
                    (entry.on_error)(&e);
                }
            }
        }

        self.inner.requests_unhandled.fetch_add(1, Ordering::Relaxed);
        debug!("Request '{}' on '{}' was not handled", message_type, queue);
        Ok(None)
    }

    /// Number of active subscribers registered for `queue`.
    pub async fn subscriber_count(&self, queue: &str) -> usize {
        let subscribers = self.inner.subscribers.read().await;
        subscribers
            .get(queue)
            .map(|entries| entries.iter().filter(|e| e.is_active()).count())
            .unwrap_or(0)
    }

    /// Number of active request handlers registered for `queue`.
    pub async fn handler_count(&self, queue: &str) -> usize {
        let handlers = self.inner.handlers.read().await;
        handlers
            .get(queue)
            .map(|entries| entries.iter().filter(|e| e.is_active()).count())
            .unwrap_or(0)
    }

    /// Snapshot of the broker's counters and registry sizes.
    pub async fn stats(&self) -> BrokerStats {
        let (subscriber_queues, active_subscribers) = {
            let subscribers = self.inner.subscribers.read().await;
            let active = subscribers
                .values()
                .map(|entries| entries.iter().filter(|e| e.is_active()).count())
                .sum();
            (subscribers.len(), active)
        };
        let (handler_queues, active_handlers) = {
            let handlers = self.inner.handlers.read().await;
            let active = handlers
                .values()
                .map(|entries| entries.iter().filter(|e| e.is_active()).count())
                .sum();
            (handlers.len(), active)
        };

        BrokerStats {
            subscriber_queues,
            active_subscribers,
            handler_queues,
            active_handlers,
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_delivered: self.inner.events_delivered.load(Ordering::Relaxed),
            requests_dispatched: self.inner.requests_dispatched.load(Ordering::Relaxed),
            requests_unhandled: self.inner.requests_unhandled.load(Ordering::Relaxed),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
