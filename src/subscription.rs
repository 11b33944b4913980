// SPDX-License-Identifier: MIT
//! In-memory pattern -> handler list (spec.md §3.7, §4.6). Dispatch for a
//! single arrival is sequential across handlers, in unspecified but
//! registration-stable order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::envelope::Envelope;

pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    pattern: String,
    handler: Handler,
}

/// A handle returned by `subscribe`; dropping or invoking it removes the
/// subscription.
pub struct Unsubscribe {
    id: u64,
    registry: Arc<Inner>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.registry.remove(self.id);
    }
}

struct Inner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().unwrap().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        Unsubscribe {
            id,
            registry: self.inner.clone(),
        }
    }

    /// All handlers whose pattern matches `concrete_subject`, in
    /// registration order.
    pub fn get_subscribers(&self, concrete_subject: &str) -> Vec<Handler> {
        self.inner
            .subscribers
            .read()
            .unwrap()
            .iter()
            .filter(|s| crate::subject::matches(&s.pattern, concrete_subject))
            .map(|s| s.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
