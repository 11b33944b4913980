// SPDX-License-Identifier: MIT
//! Per-endpoint delivery pipeline (spec.md §4.13): budget, circuit breaker,
//! backpressure, Maildir write, index insert, synchronous subscriber
//! dispatch.

use tracing::warn;

use crate::backpressure::{self, BackpressureConfig, BackpressureDecision};
use crate::budget;
use crate::circuit::CircuitBreakerManager;
use crate::dead_letter::DeadLetterQueue;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::index::{IndexEntry, MessageStatus, RelayIndex};
use crate::maildir::MaildirStore;
use crate::signal::{Signal, SignalEmitter};
use crate::subscription::SubscriptionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BudgetTtlExpired,
    BudgetMaxHopsExceeded,
    BudgetCallBudgetExhausted,
    BudgetCycleDetected,
    CircuitOpen,
    Backpressure,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BudgetTtlExpired => "ttl_expired",
            RejectReason::BudgetMaxHopsExceeded => "max_hops_exceeded",
            RejectReason::BudgetCallBudgetExhausted => "call_budget_exhausted",
            RejectReason::BudgetCycleDetected => "cycle_detected",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { pressure: Option<f64> },
    Rejected {
        reason: RejectReason,
        pressure: Option<f64>,
    },
}

/// Runs the ordered pipeline for a single `(endpoint_subject, endpoint_hash)`
/// candidate. `raw_envelope` is the as-published form; this function writes
/// that unadvanced form to disk (so a later reader — including the watcher
/// path — advances it exactly once) and dispatches to in-process
/// subscribers with a budget-advanced copy, per spec.md §4.11/§4.13.
#[allow(clippy::too_many_arguments)]
pub async fn deliver_to_endpoint(
    maildir: &MaildirStore,
    index: &RelayIndex,
    breakers: &CircuitBreakerManager,
    backpressure_config: &BackpressureConfig,
    subscriptions: &SubscriptionRegistry,
    signals: &SignalEmitter,
    dlq: &DeadLetterQueue<'_>,
    endpoint_subject: &str,
    endpoint_hash: &str,
    raw_envelope: &Envelope,
) -> Result<DeliveryOutcome> {
    if let Err(rejection) = budget::check(raw_envelope, endpoint_subject) {
        let reason = match rejection {
            budget::BudgetRejection::TtlExpired => RejectReason::BudgetTtlExpired,
            budget::BudgetRejection::MaxHopsExceeded => RejectReason::BudgetMaxHopsExceeded,
            budget::BudgetRejection::CallBudgetExhausted => RejectReason::BudgetCallBudgetExhausted,
            budget::BudgetRejection::CycleDetected => RejectReason::BudgetCycleDetected,
        };
        dlq.reject(endpoint_hash, raw_envelope, rejection.reason()).await?;
        return Ok(DeliveryOutcome::Rejected { reason, pressure: None });
    }

    if !breakers.allow(endpoint_hash) {
        return Ok(DeliveryOutcome::Rejected {
            reason: RejectReason::CircuitOpen,
            pressure: None,
        });
    }

    let bp = backpressure::check(backpressure_config, maildir, endpoint_hash).await?;
    match bp.decision {
        BackpressureDecision::Reject => {
            return Ok(DeliveryOutcome::Rejected {
                reason: RejectReason::Backpressure,
                pressure: Some(bp.pressure),
            });
        }
        BackpressureDecision::AdmitWithWarning => {
            signals.emit(
                endpoint_subject,
                &Signal {
                    endpoint_subject: endpoint_subject.to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    payload: serde_json::json!({"kind": "mailbox_pressure_warning"}),
                },
            );
        }
        BackpressureDecision::Admit => {}
    }

    maildir.ensure_maildir(endpoint_hash).await?;
    let name = match maildir.deliver(endpoint_hash, raw_envelope).await {
        Ok(name) => name,
        Err(e) => {
            breakers.record_failure(endpoint_hash);
            return Err(e);
        }
    };
    index
        .insert_message(&IndexEntry {
            id: raw_envelope.id.clone(),
            subject: raw_envelope.subject.clone(),
            sender: raw_envelope.from.clone(),
            endpoint_hash: endpoint_hash.to_string(),
            status: MessageStatus::New,
            created_at: raw_envelope.created_at.clone(),
            ttl: raw_envelope.budget.ttl,
        })
        .await?;

    let handlers = subscriptions.get_subscribers(&raw_envelope.subject);
    if handlers.is_empty() {
        // No in-process subscriber consumed it — it stays in new/, the
        // sole authoritative "undelivered" signal (spec.md §4.3), for the
        // cross-process watcher path or a future subscription to pick up.
        breakers.record_success(endpoint_hash);
        return Ok(DeliveryOutcome::Delivered {
            pressure: Some(bp.pressure),
        });
    }

    let envelope = {
        let mut e = raw_envelope.clone();
        e.budget = raw_envelope.budget.advance(endpoint_subject);
        e
    };

    let mut failure: Option<String> = None;
    for handler in &handlers {
        if let Err(e) = handler(&envelope) {
            failure = Some(e.to_string());
            break;
        }
    }

    match failure {
        Some(reason) => {
            maildir.mark_failed(endpoint_hash, &name, &reason).await?;
            index.update_status(&envelope.id, MessageStatus::Failed).await?;
            breakers.record_failure(endpoint_hash);
            warn!(endpoint_hash, reason, "subscriber handler failed");
        }
        None => {
            maildir.mark_processed(endpoint_hash, &name).await?;
            index.update_status(&envelope.id, MessageStatus::Cur).await?;
            breakers.record_success(endpoint_hash);
        }
    }

    Ok(DeliveryOutcome::Delivered {
        pressure: Some(bp.pressure),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::envelope::Budget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn envelope() -> Envelope {
        Envelope::new(
            "relay.agent.backend".into(),
            "relay.sender".into(),
            None,
            serde_json::json!({"hello": "world"}),
            Budget::new(8, 60_000, 10),
        )
    }

    #[tokio::test]
    async fn successful_delivery_moves_to_cur_and_invokes_handler() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        let breakers = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let backpressure_config = BackpressureConfig::default();
        let subscriptions = SubscriptionRegistry::new();
        let signals = SignalEmitter::new();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = subscriptions.subscribe(
            "relay.agent.>",
            Arc::new(move |_e: &Envelope| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let outcome = deliver_to_endpoint(
            &maildir,
            &index,
            &breakers,
            &backpressure_config,
            &subscriptions,
            &signals,
            &dlq,
            "relay.agent.backend",
            "abc123",
            &envelope(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Delivered { pressure: Some(_) }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(maildir.list_cur("abc123").await.unwrap().len(), 1);
        assert!(maildir.list_new("abc123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_error_moves_to_failed() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        let breakers = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let backpressure_config = BackpressureConfig::default();
        let subscriptions = SubscriptionRegistry::new();
        let signals = SignalEmitter::new();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        let _sub = subscriptions.subscribe(
            "relay.agent.>",
            Arc::new(|_e: &Envelope| anyhow::bail!("handler crashed")),
        );

        let outcome = deliver_to_endpoint(
            &maildir,
            &index,
            &breakers,
            &backpressure_config,
            &subscriptions,
            &signals,
            &dlq,
            "relay.agent.backend",
            "abc123",
            &envelope(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Delivered { pressure: Some(_) }));
        assert_eq!(maildir.list_failed("abc123").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn budget_rejection_dead_letters_and_stops() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        let breakers = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let backpressure_config = BackpressureConfig::default();
        let subscriptions = SubscriptionRegistry::new();
        let signals = SignalEmitter::new();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        let mut budget = Budget::new(8, 0, 10);
        budget.ttl = crate::envelope::now_ms() - 1;
        let expired = Envelope::new(
            "relay.agent.backend".into(),
            "relay.sender".into(),
            None,
            serde_json::json!({}),
            budget,
        );

        let outcome = deliver_to_endpoint(
            &maildir,
            &index,
            &breakers,
            &backpressure_config,
            &subscriptions,
            &signals,
            &dlq,
            "relay.agent.backend",
            "abc123",
            &expired,
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            DeliveryOutcome::Rejected {
                reason: RejectReason::BudgetTtlExpired,
                pressure: None,
            }
        ));
        assert_eq!(dlq.list_dead(Some("abc123"), 10).await.unwrap().len(), 1);
        assert!(maildir.list_new("abc123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backpressure_rejection_carries_the_pressure_ratio() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        maildir.ensure_maildir("abc123").await.unwrap();
        let breakers = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let backpressure_config = crate::backpressure::BackpressureConfig {
            enabled: true,
            max_mailbox_size: 2,
            pressure_warning_at: 0.5,
        };
        let subscriptions = SubscriptionRegistry::new();
        let signals = SignalEmitter::new();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        for _ in 0..2 {
            maildir.deliver("abc123", &envelope()).await.unwrap();
        }

        let outcome = deliver_to_endpoint(
            &maildir,
            &index,
            &breakers,
            &backpressure_config,
            &subscriptions,
            &signals,
            &dlq,
            "relay.agent.backend",
            "abc123",
            &envelope(),
        )
        .await
        .unwrap();

        match outcome {
            DeliveryOutcome::Rejected {
                reason: RejectReason::Backpressure,
                pressure: Some(p),
            } => assert_eq!(p, 1.0),
            other => panic!("expected a backpressure rejection with a pressure ratio, got {other:?}"),
        }
    }
}
