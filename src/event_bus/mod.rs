// Event Bus
//
// In-process publish/subscribe between producers (agent position sync) and
// live consumers (WebSocket feeds). Events are not persisted; one dispatcher
// task delivers them in emission order.

pub mod dispatcher;
pub mod kinds;
pub mod subscription;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use dispatcher::EventBus;
pub use kinds::{EventKind, KindName};
pub use subscription::SubscriptionHandle;

/// Handlers never run while a registry lock is held, so a poisoned lock
/// still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
