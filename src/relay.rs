// SPDX-License-Identifier: MIT
//! The facade composing every sub-component (spec.md §4.16). Owns lifecycle,
//! config hot-reload, and the `publish` pipeline end to end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::access::{AccessControl, AccessRule};
use crate::adapter::AdapterRegistry;
use crate::circuit::CircuitBreakerManager;
use crate::config::ConfigWatcher;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue, UNROUTED_HASH};
use crate::delivery::{self, DeliveryOutcome, RejectReason};
use crate::endpoint::{EndpointInfo, EndpointRegistry};
use crate::envelope::{Budget, Envelope};
use crate::error::{RelayError, Result};
use crate::index::{IndexEntry, MessageFilter, MessagePage, RelayIndex};
use crate::maildir::MaildirStore;
use crate::rate_limit::{self, RateLimitDecision};
use crate::signal::{Signal, SignalEmitter, SignalHandler, SignalUnsubscribe};
use crate::subject;
use crate::subscription::{Handler, SubscriptionRegistry, Unsubscribe};

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub from: String,
    pub reply_to: Option<String>,
    pub budget: Option<Budget>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    pub endpoint_hash: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub message_id: String,
    pub delivered_to: u32,
    pub rejected: Vec<RejectedEntry>,
    /// Pressure ratio observed for every endpoint the backpressure gate
    /// actually evaluated, keyed by endpoint hash (spec.md §4.10).
    pub mailbox_pressure: std::collections::HashMap<String, f64>,
    pub adapter_result: Option<crate::adapter::AdapterDeliveryResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayMetricsSnapshot {
    pub total_messages: i64,
    pub by_status: std::collections::HashMap<String, i64>,
    pub by_subject: Vec<(String, i64)>,
    pub uptime_secs: u64,
    pub closed: bool,
}

const DEFAULT_MAX_HOPS: u32 = 32;
const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;
const DEFAULT_CALL_BUDGET: i64 = 64;

/// Everything the bus needs, held behind a single facade. Multiple `Relay`
/// instances with disjoint `data_dir`s coexist without shared state
/// (spec.md §9).
pub struct Relay {
    data_dir: PathBuf,
    closed: AtomicBool,
    started_at: Instant,

    endpoints: EndpointRegistry,
    maildir: MaildirStore,
    index: RelayIndex,
    access: AccessControl,
    subscriptions: SubscriptionRegistry,
    signals: SignalEmitter,
    breakers: CircuitBreakerManager,
    adapters: AdapterRegistry,
    config: ConfigWatcher,
}

impl Relay {
    pub async fn open(data_dir: &Path) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(data_dir).await?;

        let endpoints = EndpointRegistry::load(data_dir).await?;
        let maildir = MaildirStore::new(data_dir);
        let index = RelayIndex::open(data_dir).await?;
        let access = AccessControl::load(data_dir).await?;
        let config = ConfigWatcher::start(data_dir);
        let settings = config.current().await;

        let relay = Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            closed: AtomicBool::new(false),
            started_at: Instant::now(),
            endpoints,
            maildir,
            index,
            access,
            subscriptions: SubscriptionRegistry::new(),
            signals: SignalEmitter::new(),
            breakers: CircuitBreakerManager::new(settings.circuit_breaker),
            adapters: AdapterRegistry::new(),
            config,
        });

        info!(data_dir = %data_dir.display(), "relay opened");
        Ok(relay)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RelayError::RelayClosed)
        } else {
            Ok(())
        }
    }

    /// validate -> access check -> rate-limit check (once) -> build envelope
    /// -> find matching endpoints -> per-endpoint delivery pipeline ->
    /// adapter fan-out -> dead-letter if nothing accepted it (spec.md §2, §4.13).
    pub async fn publish(
        &self,
        subject_str: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        self.check_open()?;
        subject::validate(subject_str).map_err(|e| RelayError::InvalidSubject {
            reason: e.to_string(),
        })?;

        let check = self.access.check_access(&options.from, subject_str).await;
        if !check.allowed {
            return Err(RelayError::AccessDenied {
                from: options.from.clone(),
                to: subject_str.to_string(),
            });
        }

        let settings = self.config.current().await;
        if rate_limit::check(&settings.rate_limit, &self.index, &options.from).await? == RateLimitDecision::Reject {
            return Ok(PublishResult {
                message_id: String::new(),
                delivered_to: 0,
                rejected: vec![RejectedEntry {
                    endpoint_hash: "*".to_string(),
                    reason: "rate_limited".to_string(),
                }],
                mailbox_pressure: std::collections::HashMap::new(),
                adapter_result: None,
            });
        }

        let budget = options
            .budget
            .unwrap_or_else(|| Budget::new(DEFAULT_MAX_HOPS, DEFAULT_TTL_MS, DEFAULT_CALL_BUDGET));
        let envelope = Envelope::new(
            subject_str.to_string(),
            options.from.clone(),
            options.reply_to.clone(),
            payload,
            budget,
        );

        let matches = self.endpoints.matching(subject_str);
        let mut delivered_to = 0u32;
        let mut rejected = Vec::new();
        let mut mailbox_pressure = std::collections::HashMap::new();
        let dlq = DeadLetterQueue::new(&self.maildir, &self.index);

        for endpoint in &matches {
            let backpressure_config = settings.backpressure.clone();
            let outcome = delivery::deliver_to_endpoint(
                &self.maildir,
                &self.index,
                &self.breakers,
                &backpressure_config,
                &self.subscriptions,
                &self.signals,
                &dlq,
                &endpoint.subject,
                &endpoint.hash,
                &envelope,
            )
            .await?;

            match outcome {
                DeliveryOutcome::Delivered { pressure } => {
                    delivered_to += 1;
                    if let Some(p) = pressure {
                        mailbox_pressure.insert(endpoint.hash.clone(), p);
                    }
                }
                DeliveryOutcome::Rejected { reason, pressure } => {
                    rejected.push(RejectedEntry {
                        endpoint_hash: endpoint.hash.clone(),
                        reason: reason_to_str(&reason).to_string(),
                    });
                    if let Some(p) = pressure {
                        mailbox_pressure.insert(endpoint.hash.clone(), p);
                    }
                }
            }
        }

        let adapter_result = self.adapters.deliver(subject_str, &envelope, None).await;
        if let Some(ref result) = adapter_result {
            if result.success {
                self.index
                    .update_status(&envelope.id, crate::index::MessageStatus::Delivered)
                    .await
                    .ok();
                delivered_to += 1;
            }
        }

        if matches.is_empty() && adapter_result.is_none() && delivered_to == 0 {
            dlq.reject(UNROUTED_HASH, &envelope, "no matching endpoint, adapter, or subscriber")
                .await?;
        }

        Ok(PublishResult {
            message_id: envelope.id,
            delivered_to,
            rejected,
            mailbox_pressure,
            adapter_result,
        })
    }

    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Unsubscribe> {
        self.check_open()?;
        Ok(self.subscriptions.subscribe(pattern, handler))
    }

    pub fn signal(&self, subject_str: &str, payload: serde_json::Value) -> Result<()> {
        self.check_open()?;
        subject::validate(subject_str).map_err(|e| RelayError::InvalidSubject {
            reason: e.to_string(),
        })?;
        self.signals.emit(
            subject_str,
            &Signal {
                endpoint_subject: subject_str.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                payload,
            },
        );
        Ok(())
    }

    pub fn on_signal(&self, pattern: &str, handler: SignalHandler) -> Result<SignalUnsubscribe> {
        self.check_open()?;
        Ok(self.signals.subscribe(pattern, handler))
    }

    pub async fn register_endpoint(&self, subject_str: &str) -> Result<EndpointInfo> {
        self.check_open()?;
        subject::validate(subject_str).map_err(|e| RelayError::InvalidSubject {
            reason: e.to_string(),
        })?;
        let info = self.endpoints.register(subject_str).await?;
        self.maildir.ensure_maildir(&info.hash).await?;
        Ok(info)
    }

    pub async fn unregister_endpoint(&self, subject_str: &str) -> Result<bool> {
        self.check_open()?;
        self.endpoints.unregister(subject_str).await
    }

    pub fn list_endpoints(&self) -> Result<Vec<EndpointInfo>> {
        self.check_open()?;
        Ok(self.endpoints.list())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<IndexEntry>> {
        self.check_open()?;
        self.index.get_message(id).await
    }

    pub async fn list_messages(&self, filter: MessageFilter) -> Result<MessagePage> {
        self.check_open()?;
        self.index.query_messages(&filter).await
    }

    /// Read `new/` + `cur/` for a registered subject, newest first.
    pub async fn read_inbox(&self, subject_str: &str, limit: usize) -> Result<Vec<Envelope>> {
        self.check_open()?;
        let info = self
            .endpoints
            .get(subject_str)
            .ok_or_else(|| RelayError::EndpointNotFound {
                subject: subject_str.to_string(),
            })?;

        let mut names = self.maildir.list_new(&info.hash).await?;
        names.extend(self.maildir.list_cur(&info.hash).await?);
        names.sort_unstable();
        names.reverse();
        names.truncate(limit.max(1));

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let dir = if self.maildir.list_new(&info.hash).await?.contains(&name) {
                "new"
            } else {
                "cur"
            };
            out.push(self.maildir.read_envelope(&info.hash, dir, &name).await?);
        }
        Ok(out)
    }

    pub async fn get_dead_letters(&self, endpoint_hash: Option<&str>, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.check_open()?;
        let dlq = DeadLetterQueue::new(&self.maildir, &self.index);
        dlq.list_dead(endpoint_hash, limit).await
    }

    pub async fn add_access_rule(&self, rule: AccessRule) -> Result<()> {
        self.check_open()?;
        self.access.add_rule(rule).await
    }

    pub async fn remove_access_rule(&self, from: &str, to: &str) -> Result<bool> {
        self.check_open()?;
        self.access.remove_rule(from, to).await
    }

    pub async fn list_access_rules(&self) -> Result<Vec<AccessRule>> {
        self.check_open()?;
        Ok(self.access.list_rules().await)
    }

    /// Drop all index rows and rescan every endpoint's `new/`, `cur/`,
    /// `failed/` from disk (spec.md §4.4, invariant 4).
    pub async fn rebuild_index(&self) -> Result<u64> {
        self.check_open()?;
        let endpoints: Vec<(String, String)> = self
            .endpoints
            .list()
            .into_iter()
            .map(|e| (e.subject, e.hash))
            .collect();
        self.index.rebuild(&self.maildir, &endpoints).await
    }

    pub async fn get_metrics(&self) -> Result<RelayMetricsSnapshot> {
        self.check_open()?;
        let metrics = self.index.get_metrics().await?;
        Ok(RelayMetricsSnapshot {
            total_messages: metrics.total_messages,
            by_status: metrics.by_status,
            by_subject: metrics.by_subject,
            uptime_secs: self.started_at.elapsed().as_secs(),
            closed: self.closed.load(Ordering::SeqCst),
        })
    }

    /// Idempotent: stops watchers, shuts the adapter registry down, closes
    /// SQLite (checkpointing WAL) (spec.md §4.16, §7).
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.adapters.shutdown().await;
        self.index.close().await;
        info!(data_dir = %self.data_dir.display(), "relay closed");
        Ok(())
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }
}

fn reason_to_str(reason: &RejectReason) -> &'static str {
    match reason {
        RejectReason::BudgetTtlExpired => "ttl_expired",
        RejectReason::BudgetMaxHopsExceeded => "max_hops_exceeded",
        RejectReason::BudgetCallBudgetExhausted => "call_budget_exhausted",
        RejectReason::BudgetCycleDetected => "cycle_detected",
        RejectReason::CircuitOpen => "circuit_open",
        RejectReason::Backpressure => "backpressure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[tokio::test]
    async fn publish_to_registered_endpoint_with_subscriber_delivers_once() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();
        relay.register_endpoint("relay.agent.backend").await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = relay
            .subscribe(
                "relay.agent.>",
                Arc::new(move |_e: &Envelope| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let result = relay
            .publish(
                "relay.agent.backend",
                serde_json::json!({"hello": "world"}),
                PublishOptions {
                    from: "relay.sender".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.delivered_to, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_expired_ttl_dead_letters_and_delivers_nothing() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();
        relay.register_endpoint("relay.agent.backend").await.unwrap();

        let mut budget = Budget::new(8, 0, 10);
        budget.ttl = crate::envelope::now_ms() - 1000;

        let result = relay
            .publish(
                "relay.agent.backend",
                serde_json::json!({}),
                PublishOptions {
                    from: "relay.sender".to_string(),
                    budget: Some(budget),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.delivered_to, 0);
        let dead = relay.get_dead_letters(None, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("expired"));
    }

    #[tokio::test]
    async fn access_denied_rejects_with_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();
        relay.register_endpoint("relay.agent.protected").await.unwrap();
        relay
            .add_access_rule(AccessRule {
                from: "relay.attacker".to_string(),
                to: "relay.agent.protected".to_string(),
                action: crate::access::RuleAction::Deny,
                priority: 100,
            })
            .await
            .unwrap();

        let err = relay
            .publish(
                "relay.agent.protected",
                serde_json::json!({}),
                PublishOptions {
                    from: "relay.attacker".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_subsequent_calls() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();
        relay.close().await.unwrap();
        relay.close().await.unwrap();

        let err = relay.list_endpoints().unwrap_err();
        assert!(matches!(err, RelayError::RelayClosed));
    }

    #[tokio::test]
    async fn register_endpoint_rejects_wildcard_subject() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();

        let err = relay.register_endpoint("relay.agent.*").await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidSubject { .. }));
    }

    #[tokio::test]
    async fn unrouted_publish_dead_letters() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::open(dir.path()).await.unwrap();

        let result = relay
            .publish(
                "relay.agent.nobody",
                serde_json::json!({}),
                PublishOptions {
                    from: "relay.sender".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.delivered_to, 0);
        let dead = relay.get_dead_letters(None, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
    }
}
