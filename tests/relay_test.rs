//! End-to-end scenario coverage against a real `Relay` instance in a
//! tempdir. S1/S2/S6 are already covered as unit tests inside
//! `relay.rs`'s own `#[cfg(test)]` module; this file covers the
//! remaining scenarios plus a couple of cross-cutting invariants that
//! only make sense to check end to end.

use relay::envelope::Budget;
use relay::{PublishOptions, Relay};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn open_relay_with_config(json: Option<&str>) -> (Arc<Relay>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    if let Some(json) = json {
        tokio::fs::write(dir.path().join("config.json"), json)
            .await
            .unwrap();
    }
    let relay = Relay::open(dir.path()).await.unwrap();
    (relay, dir)
}

/// S3 — cycle: publishing with the destination already in the ancestor
/// chain is dead-lettered with a cycle reason, never delivered.
#[tokio::test]
async fn scenario_cycle_is_rejected_and_dead_lettered() {
    let (relay, _dir) = open_relay_with_config(None).await;
    relay.register_endpoint("relay.agent.loop").await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    relay
        .subscribe(
            "relay.agent.loop",
            Arc::new(move |_env| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let mut budget = Budget::new(32, 60_000, 10);
    budget.ancestor_chain = vec!["relay.agent.loop".to_string()];

    let result = relay
        .publish(
            "relay.agent.loop",
            serde_json::json!({}),
            PublishOptions {
                from: "relay.sender".into(),
                reply_to: None,
                budget: Some(budget),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.delivered_to, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let dead = relay.get_dead_letters(None, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("cycle"));
}

/// S4 — rate limited: the 6th publish from a sender that has hit
/// `maxPerWindow` is rejected wholesale, before endpoint fan-out — the
/// second endpoint's mailbox never sees it.
#[tokio::test]
async fn scenario_rate_limit_blocks_before_fanout() {
    let config = r#"{"reliability": {"rateLimit": {"enabled": true, "maxPerWindow": 5, "windowSecs": 60}}}"#;
    let (relay, _dir) = open_relay_with_config(Some(config)).await;

    relay.register_endpoint("relay.agent.a").await.unwrap();
    let endpoint_b = relay.register_endpoint("relay.agent.b").await.unwrap();

    for _ in 0..5 {
        let result = relay
            .publish(
                "relay.agent.a",
                serde_json::json!({}),
                PublishOptions {
                    from: "relay.flood".into(),
                    reply_to: None,
                    budget: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.delivered_to, 1);
    }

    let result = relay
        .publish(
            "relay.agent.b",
            serde_json::json!({}),
            PublishOptions {
                from: "relay.flood".into(),
                reply_to: None,
                budget: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.message_id, "");
    assert_eq!(result.delivered_to, 0);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].endpoint_hash, "*");
    assert_eq!(result.rejected[0].reason, "rate_limited");

    let inbox = relay.read_inbox(&endpoint_b.subject, 10).await.unwrap();
    assert!(inbox.is_empty());
}

/// S5 — backpressure: with no subscriber and a mailbox ceiling of 2,
/// the first two publishes land in `new/`; the third is rejected and
/// never dead-lettered (reliability rejections don't DLQ).
#[tokio::test]
async fn scenario_backpressure_rejects_once_mailbox_is_full() {
    let config = r#"{"reliability": {"backpressure": {"enabled": true, "maxMailboxSize": 2, "pressureWarningAt": 0.5}}}"#;
    let (relay, _dir) = open_relay_with_config(Some(config)).await;
    relay.register_endpoint("relay.agent.sink").await.unwrap();

    for _ in 0..2 {
        let result = relay
            .publish(
                "relay.agent.sink",
                serde_json::json!({}),
                PublishOptions {
                    from: "relay.sender".into(),
                    reply_to: None,
                    budget: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.delivered_to, 1);
    }

    let result = relay
        .publish(
            "relay.agent.sink",
            serde_json::json!({}),
            PublishOptions {
                from: "relay.sender".into(),
                reply_to: None,
                budget: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.delivered_to, 0);
    assert_eq!(result.rejected[0].reason, "backpressure");

    let inbox = relay.read_inbox("relay.agent.sink", 10).await.unwrap();
    assert_eq!(inbox.len(), 2);

    let dead = relay.get_dead_letters(None, 10).await.unwrap();
    assert!(dead.is_empty());
}

/// Invariant 9: two concurrent publishes to the same endpoint yield
/// two distinct message ids, both delivered.
#[tokio::test]
async fn invariant_concurrent_publishes_get_distinct_ids() {
    let (relay, _dir) = open_relay_with_config(None).await;
    relay.register_endpoint("relay.agent.busy").await.unwrap();

    let (a, b) = tokio::join!(
        relay.publish(
            "relay.agent.busy",
            serde_json::json!({"n": 1}),
            PublishOptions {
                from: "relay.sender.a".into(),
                reply_to: None,
                budget: None,
            },
        ),
        relay.publish(
            "relay.agent.busy",
            serde_json::json!({"n": 2}),
            PublishOptions {
                from: "relay.sender.b".into(),
                reply_to: None,
                budget: None,
            },
        ),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_ne!(a.message_id, b.message_id);
    assert_eq!(a.delivered_to, 1);
    assert_eq!(b.delivered_to, 1);

    let inbox = relay.read_inbox("relay.agent.busy", 10).await.unwrap();
    assert_eq!(inbox.len(), 2);
}

/// Invariant 10: total message count from the index matches the
/// mailbox file count after a rebuild.
#[tokio::test]
async fn invariant_metrics_total_matches_rebuilt_index() {
    let (relay, _dir) = open_relay_with_config(None).await;
    relay.register_endpoint("relay.agent.counted").await.unwrap();

    for i in 0..4 {
        relay
            .publish(
                "relay.agent.counted",
                serde_json::json!({"i": i}),
                PublishOptions {
                    from: "relay.sender".into(),
                    reply_to: None,
                    budget: None,
                },
            )
            .await
            .unwrap();
    }

    let rebuilt = relay.rebuild_index().await.unwrap();
    let metrics = relay.get_metrics().await.unwrap();

    assert_eq!(rebuilt, 4);
    assert_eq!(metrics.total_messages, 4);
}
