use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::kinds::KindEntry;

/// Bus-unique subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Returned by `register`; pass it back to `unregister` to detach the handler.
///
/// Identity is the id, never the callback: registering the same closure
/// twice yields two handles.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    kind: Arc<KindEntry>,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, kind: Arc<KindEntry>, active: Arc<AtomicBool>) -> Self {
        Self { id, kind, active }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }

    /// False once the subscription has been removed
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deactivate first so the dispatcher skips the handler even if it is
    /// holding an older snapshot, then drop it from the list.
    pub(crate) fn detach(&self) -> bool {
        self.active.store(false, Ordering::Release);
        self.kind.remove(self.id)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("active", &self.is_active())
            .finish()
    }
}
