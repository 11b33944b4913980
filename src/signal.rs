// SPDX-License-Identifier: MIT
//! Ephemeral, in-memory pub/sub for signals (spec.md §3.8, §4.7). Never
//! touches disk, never indexed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub endpoint_subject: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

pub type SignalHandler = Arc<dyn Fn(&str, &Signal) + Send + Sync>;

struct Listener {
    id: u64,
    pattern: String,
    handler: SignalHandler,
}

pub struct SignalUnsubscribe {
    id: u64,
    emitter: Arc<Inner>,
}

impl SignalUnsubscribe {
    pub fn unsubscribe(self) {
        self.emitter.listeners.write().unwrap().retain(|l| l.id != self.id);
    }
}

struct Inner {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct SignalEmitter {
    inner: Arc<Inner>,
}

impl Default for SignalEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Run every matching handler synchronously.
    pub fn emit(&self, subject: &str, signal: &Signal) {
        let handlers: Vec<SignalHandler> = self
            .inner
            .listeners
            .read()
            .unwrap()
            .iter()
            .filter(|l| crate::subject::matches(&l.pattern, subject))
            .map(|l| l.handler.clone())
            .collect();
        for h in handlers {
            h(subject, signal);
        }
    }

    pub fn subscribe(&self, pattern: &str, handler: SignalHandler) -> SignalUnsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.write().unwrap().push(Listener {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        SignalUnsubscribe {
            id,
            emitter: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_runs_matching_handlers_only() {
        let emitter = SignalEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _sub = emitter.subscribe(
            "relay.agent.*",
            Arc::new(move |_s, _sig| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let signal = Signal {
            endpoint_subject: "relay.agent.backend".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload: serde_json::json!({"kind": "backpressure"}),
        };
        emitter.emit("relay.agent.backend", &signal);
        emitter.emit("relay.other.thing", &signal);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
