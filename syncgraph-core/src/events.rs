//! Typed publish/subscribe.
//!
//! Every event stream in the crate is a `Subscribers<E>` for a concrete
//! payload type `E`; there are no string-keyed event names.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by `subscribe`, used to unsubscribe.
///
/// Unique across all streams in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(0);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

/// Ordered list of callbacks for one event type.
///
/// Callbacks fire synchronously in registration order.
pub struct Subscribers<E> {
    callbacks: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Returns `false` if the id was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(sid, _)| *sid != id);
        self.callbacks.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, cb) in self.callbacks.iter_mut() {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.callbacks.len())
            .finish()
    }
}
