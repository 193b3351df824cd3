use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::kinds::KindEntry;

/// One occurrence of an event kind
///
/// The payload is opaque to the bus; subscribers recover it with
/// [`Event::payload`].
pub struct Event {
    kind: Arc<KindEntry>,
    /// Bus-wide monotonic sequence (emission order)
    seq: u64,
    emitted_at: DateTime<Utc>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub(crate) fn new(kind: Arc<KindEntry>, seq: u64, payload: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            kind,
            seq,
            emitted_at: Utc::now(),
            payload,
        }
    }

    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }

    pub(crate) fn kind(&self) -> &Arc<KindEntry> {
        &self.kind
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// The payload as `P`, or `None` when it holds another type
    pub fn payload<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        self.payload.clone().downcast::<P>().ok()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind_name())
            .field("seq", &self.seq)
            .field("emitted_at", &self.emitted_at)
            .finish_non_exhaustive()
    }
}
