use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{self, BoxFuture, FutureExt};
use tracing::debug;

use super::dispatcher::EventBus;
use super::lock;
use super::subscription::{SubscriptionHandle, SubscriptionId};
use super::types::Event;

/// Well-known event kind names
///
/// Names are free-form strings; these are the ones the server emits.
pub struct KindName;

impl KindName {
    /// An agent reported a new GPS fix (payload: `AgentReport`)
    pub const NEW_AGENT: &'static str = "NEW-AGENT";
}

pub(crate) type ErasedHandler =
    Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) handler: ErasedHandler,
}

impl Subscriber {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Registry record for one kind name. Lives as long as the bus.
pub(crate) struct KindEntry {
    name: String,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl KindEntry {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push(&self, subscriber: Subscriber) {
        lock(&self.subscribers).push(subscriber);
    }

    /// Removes the subscriber with `id`, keeping the order of the rest.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        match subscribers.iter().position(|s| s.id == id) {
            Some(index) => {
                subscribers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Consistent copy of the subscriber list for one dispatch round.
    pub(crate) fn snapshot(&self) -> Vec<Subscriber> {
        lock(&self.subscribers).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Typed handle to a named event kind
///
/// Every handle for the same name refers to the same registry entry,
/// whatever its payload type. Handlers registered through an
/// `EventKind<P>` only ever see payloads of type `P`; events carrying any
/// other type are skipped for them.
pub struct EventKind<P> {
    entry: Arc<KindEntry>,
    bus: EventBus,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for EventKind<P> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            bus: self.bus.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for EventKind<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventKind")
            .field("name", &self.entry.name())
            .field("payload", &type_name::<P>())
            .finish()
    }
}

impl<P> EventKind<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(entry: Arc<KindEntry>, bus: EventBus) -> Self {
        Self {
            entry,
            bus,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Queue `payload` for dispatch. Returns without waiting for handlers.
    pub fn emit(&self, payload: P) {
        self.bus.enqueue(self.entry.clone(), Arc::new(payload));
    }

    /// Append `handler` to this kind's subscriber list
    pub fn register<F, Fut>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |event: Arc<Event>| match event.payload::<P>() {
            Some(payload) => handler(payload).boxed(),
            None => {
                debug!(
                    kind = %event.kind_name(),
                    seq = event.seq(),
                    expected = type_name::<P>(),
                    "payload type mismatch, skipping handler"
                );
                future::ready(Ok(())).boxed()
            }
        });

        self.bus.subscribe(&self.entry, erased)
    }

    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        self.bus.unregister(handle)
    }

    pub fn subscriber_count(&self) -> usize {
        self.entry.len()
    }

    /// True when both handles refer to the same registry entry
    pub fn same_kind<Q>(&self, other: &EventKind<Q>) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}
