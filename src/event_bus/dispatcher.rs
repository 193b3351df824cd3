use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::kinds::{ErasedHandler, EventKind, KindEntry, Subscriber};
use super::lock;
use super::subscription::{SubscriptionHandle, SubscriptionId};
use super::types::Event;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("event bus dispatcher already started")]
    AlreadyRunning,

    #[error("event bus has been shut down")]
    ShutDown,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

struct BusInner {
    kinds: Mutex<HashMap<String, Arc<KindEntry>>>,
    queue_tx: mpsc::UnboundedSender<Event>,
    /// Taken by the single dispatcher on `run`
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_subscription: AtomicU64,
    next_seq: AtomicU64,
}

/// Event Bus
///
/// Process-wide registry of named event kinds fed through one dispatch
/// loop. Cloning is cheap; every clone shares the same registry and queue.
///
/// Delivery contract:
/// - the queue is unbounded, so `emit` never blocks
/// - one dispatcher runs handlers one at a time, in registration order,
///   and finishes every handler of an event before starting the next event
/// - a handler that errors or panics is logged and skipped; no retries
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(BusInner {
                kinds: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                stop_tx,
                worker: Mutex::new(None),
                next_subscription: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Get or create the kind named `name`
    ///
    /// Concurrent calls with the same name always resolve to one entry.
    pub fn kind<P>(&self, name: &str) -> EventKind<P>
    where
        P: Send + Sync + 'static,
    {
        let entry = {
            let mut kinds = lock(&self.inner.kinds);
            kinds
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(kind = name, "event kind created");
                    Arc::new(KindEntry::new(name))
                })
                .clone()
        };

        EventKind::new(entry, self.clone())
    }

    pub fn emit<P>(&self, name: &str, payload: P)
    where
        P: Send + Sync + 'static,
    {
        self.kind::<P>(name).emit(payload);
    }

    pub fn register<P, F, Fut>(&self, name: &str, handler: F) -> SubscriptionHandle
    where
        P: Send + Sync + 'static,
        F: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.kind::<P>(name).register(handler)
    }

    /// Detach a subscription
    ///
    /// Returns `false` when the handle was already removed. A handler that is
    /// running when this is called finishes, but is never started again.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        let removed = handle.detach();
        if removed {
            debug!(kind = %handle.kind_name(), subscription = %handle.id(), "handler unregistered");
        }
        removed
    }

    /// Names of every kind created so far
    pub fn kind_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.kinds).keys().cloned().collect();
        names.sort();
        names
    }

    /// Start the dispatch loop on the current tokio runtime
    pub fn run(&self) -> Result<(), EventBusError> {
        let runtime = tokio::runtime::Handle::try_current()?;

        if *self.inner.stop_tx.borrow() {
            return Err(EventBusError::ShutDown);
        }

        let queue = lock(&self.inner.queue_rx)
            .take()
            .ok_or(EventBusError::AlreadyRunning)?;
        let stop = self.inner.stop_tx.subscribe();

        let worker = runtime.spawn(dispatch_loop(queue, stop));
        *lock(&self.inner.worker) = Some(worker);

        info!("Event bus dispatcher started");
        Ok(())
    }

    /// Stop the dispatch loop and wait for it to exit
    ///
    /// The event being dispatched when the signal arrives is completed;
    /// events still queued are dropped. Calling this more than once is fine.
    pub async fn shutdown(&self) {
        self.inner.stop_tx.send_replace(true);

        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Event bus dispatcher terminated abnormally");
            }
        }
    }

    pub(crate) fn subscribe(&self, entry: &Arc<KindEntry>, handler: ErasedHandler) -> SubscriptionHandle {
        let id = SubscriptionId::new(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));

        entry.push(Subscriber {
            id,
            active: active.clone(),
            handler,
        });
        debug!(kind = %entry.name(), subscription = %id, "handler registered");

        SubscriptionHandle::new(id, entry.clone(), active)
    }

    pub(crate) fn enqueue(&self, entry: Arc<KindEntry>, payload: Arc<dyn Any + Send + Sync>) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(entry, seq, payload);

        if let Err(mpsc::error::SendError(event)) = self.inner.queue_tx.send(event) {
            debug!(kind = %event.kind_name(), seq, "event bus stopped, event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut queue: mpsc::UnboundedReceiver<Event>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            next = queue.recv() => match next {
                Some(event) => dispatch(Arc::new(event)).await,
                None => break,
            },
        }
    }

    queue.close();
    let mut abandoned = 0usize;
    while queue.try_recv().is_ok() {
        abandoned += 1;
    }

    info!(abandoned, "Event bus dispatcher stopped");
}

/// Deliver one event to every active subscriber of its kind, in order
async fn dispatch(event: Arc<Event>) {
    let subscribers = event.kind().snapshot();
    trace!(kind = %event.kind_name(), seq = event.seq(), subscribers = subscribers.len(), "dispatching event");

    for subscriber in subscribers {
        if !subscriber.is_active() {
            continue;
        }

        let handler = subscriber.handler.clone();
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
        let outcome = match call {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    kind = %event.kind_name(),
                    seq = event.seq(),
                    subscription = %subscriber.id,
                    error = %e,
                    "event handler failed"
                );
            }
            Err(panic) => {
                error!(
                    kind = %event.kind_name(),
                    seq = event.seq(),
                    subscription = %subscriber.id,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
