//! Registry entries and the handles callers use to remove them.

use super::{BrokerInner, DeliverFn, HandlerErrorFn, HandlerFn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub(crate) struct SubscriberEntry {
    pub(crate) id: u64,
    active: AtomicBool,
    pub(crate) deliver: DeliverFn,
}

impl SubscriberEntry {
    pub(crate) fn new(id: u64, deliver: DeliverFn) -> Self {
        Self { id, active: AtomicBool::new(true), deliver }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

pub(crate) struct HandlerEntry {
    pub(crate) id: u64,
    active: AtomicBool,
    pub(crate) handler: HandlerFn,
    pub(crate) on_error: HandlerErrorFn,
}

impl HandlerEntry {
    pub(crate) fn new(id: u64, handler: HandlerFn, on_error: HandlerErrorFn) -> Self {
        Self { id, active: AtomicBool::new(true), handler, on_error }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

trait Registered {
    fn registration_id(&self) -> u64;
}

impl Registered for SubscriberEntry {
    fn registration_id(&self) -> u64 {
        self.id
    }
}

impl Registered for HandlerEntry {
    fn registration_id(&self) -> u64 {
        self.id
    }
}

fn prune<T: Registered>(registry: &mut HashMap<String, Vec<Arc<T>>>, queue: &str, id: u64) {
    if let Some(entries) = registry.get_mut(queue) {
        entries.retain(|entry| entry.registration_id() != id);
        if entries.is_empty() {
            registry.remove(queue);
        }
    }
}

fn subscriber_registry(broker: &BrokerInner) -> &RwLock<HashMap<String, Vec<Arc<SubscriberEntry>>>> {
    &broker.subscribers
}

fn handler_registry(broker: &BrokerInner) -> &RwLock<HashMap<String, Vec<Arc<HandlerEntry>>>> {
    &broker.handlers
}

/// Physically removes a deactivated entry without blocking the caller.
///
/// Runs as a spawned task when a runtime is available. The caller may be a
/// delivery callback running under the registry's read lock, so waiting for
/// the write lock inline would deadlock.
fn schedule_removal<T, F>(broker: Arc<BrokerInner>, queue: String, id: u64, registry: F)
where
    T: Registered + Send + Sync + 'static,
    F: Fn(&BrokerInner) -> &RwLock<HashMap<String, Vec<Arc<T>>>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                let mut entries = registry(&broker).write().await;
                prune(&mut entries, &queue, id);
                debug!("➖ Registration {} removed from queue '{}'", id, queue);
            });
        }
        Err(_) => {
            let mut entries = registry(&broker).blocking_write();
            prune(&mut entries, &queue, id);
        }
    }
}

/// Handle to one subscriber registration.
///
/// Dropping the handle does not unsubscribe; call
/// [`SubscriberHandle::remove`].
pub struct SubscriberHandle {
    queue: String,
    entry: Arc<SubscriberEntry>,
    broker: Arc<BrokerInner>,
}

impl SubscriberHandle {
    pub(crate) fn new(queue: String, entry: Arc<SubscriberEntry>, broker: Arc<BrokerInner>) -> Self {
        Self { queue, entry, broker }
    }

    /// The queue this registration is bound to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// False once [`remove`](Self::remove) was called.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Stops delivery immediately; the registry entry is dropped in the
    /// background. Calling this more than once is a no-op.
    pub fn remove(&self) {
        if self.entry.deactivate() {
            schedule_removal(self.broker.clone(), self.queue.clone(), self.entry.id, subscriber_registry);
        }
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("queue", &self.queue)
            .field("id", &self.entry.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Handle to one request handler registration.
///
/// Dropping the handle does not unregister; call [`HandlerHandle::remove`].
pub struct HandlerHandle {
    queue: String,
    entry: Arc<HandlerEntry>,
    broker: Arc<BrokerInner>,
}

impl HandlerHandle {
    pub(crate) fn new(queue: String, entry: Arc<HandlerEntry>, broker: Arc<BrokerInner>) -> Self {
        Self { queue, entry, broker }
    }

    /// The queue this registration is bound to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// False once [`remove`](Self::remove) was called.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Excludes this handler from every dispatch that starts after the call.
    /// A dispatch already awaiting this handler is not interrupted.
    pub fn remove(&self) {
        if self.entry.deactivate() {
            schedule_removal(self.broker.clone(), self.queue.clone(), self.entry.id, handler_registry);
        }
    }
}

impl std::fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("queue", &self.queue)
            .field("id", &self.entry.id)
            .field("active", &self.is_active())
            .finish()
    }
}
