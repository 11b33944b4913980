// SPDX-License-Identifier: MIT
//! Unified adapter fan-out (spec.md §4.14). Adapters are external
//! collaborators (Telegram, webhook, an agent runtime); only the interface
//! they must satisfy lives here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::envelope::Envelope;

const ADAPTER_DEADLINE: Duration = Duration::from_secs(15);

/// Shape spec.md §4.14/§6.1 documents for the bus's own `adapterResult`
/// field: one outcome, not one per registered adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDeliveryResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Back-reference handed to adapters so inbound events can publish into the
/// bus without the bus depending on the adapter registry (spec.md §9).
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_inbound(&self, subject: &str, payload: Value, from: &str) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    async fn deliver(&self, subject: &str, envelope: &Envelope, context: Option<Value>) -> anyhow::Result<()>;
    async fn set_relay(&self, publisher: Arc<dyn Publisher>);
    async fn shutdown(&self);
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, adapter: Arc<dyn Adapter>, publisher: Arc<dyn Publisher>) {
        adapter.set_relay(publisher).await;
        self.adapters.write().await.push(adapter);
    }

    /// Deliver to every registered adapter, each under its own fixed
    /// deadline; a timeout counts as failure. Not short-circuited — every
    /// adapter gets a chance — but the bus-facing result is a single
    /// aggregate (spec.md §4.14): `success` iff every adapter succeeded,
    /// `error` is the first failure's message, `durationMs` spans the
    /// whole fan-out. `None` when no adapter is registered.
    pub async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<Value>,
    ) -> Option<AdapterDeliveryResult> {
        let adapters = self.adapters.read().await;
        if adapters.is_empty() {
            return None;
        }

        let started = std::time::Instant::now();
        let mut first_error: Option<String> = None;
        for adapter in adapters.iter() {
            let outcome = tokio::time::timeout(
                ADAPTER_DEADLINE,
                adapter.deliver(subject, envelope, context.clone()),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                }
                Err(_) => {
                    warn!(subject, "adapter delivery timed out after {ADAPTER_DEADLINE:?}");
                    if first_error.is_none() {
                        first_error = Some("timeout".to_string());
                    }
                }
            }
        }

        Some(AdapterDeliveryResult {
            success: first_error.is_none(),
            error: first_error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub async fn shutdown(&self) {
        let adapters = self.adapters.read().await;
        for adapter in adapters.iter() {
            adapter.shutdown().await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.adapters.read().await.is_empty()
    }
}
