// SPDX-License-Identifier: MIT
//! Mailbox pressure gating (spec.md §3.5, §4.10). Pressure is the ratio of
//! pending (`new/`) messages to the configured ceiling for that endpoint.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::maildir::MaildirStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub max_mailbox_size: u64,
    pub pressure_warning_at: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mailbox_size: 1000,
            pressure_warning_at: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureDecision {
    Admit,
    AdmitWithWarning,
    Reject,
}

/// Decision plus the raw pressure ratio it was computed from — the ratio
/// itself is a caller-visible value (spec.md §4.10: "returned in the
/// publish result so senders can shed load preemptively"), not just an
/// internal gating input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureCheck {
    pub decision: BackpressureDecision,
    pub pressure: f64,
}

pub async fn check(
    config: &BackpressureConfig,
    maildir: &MaildirStore,
    endpoint_hash: &str,
) -> Result<BackpressureCheck> {
    if !config.enabled || config.max_mailbox_size == 0 {
        return Ok(BackpressureCheck {
            decision: BackpressureDecision::Admit,
            pressure: 0.0,
        });
    }
    let count = maildir.count_new(endpoint_hash).await?;
    let pressure = count as f64 / config.max_mailbox_size as f64;
    let decision = if pressure >= 1.0 {
        BackpressureDecision::Reject
    } else if pressure >= config.pressure_warning_at {
        BackpressureDecision::AdmitWithWarning
    } else {
        BackpressureDecision::Admit
    };
    Ok(BackpressureCheck { decision, pressure })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Budget, Envelope};
    use tempfile::TempDir;

    fn envelope() -> Envelope {
        Envelope::new(
            "relay.agent.backend".into(),
            "relay.sender".into(),
            None,
            serde_json::json!({}),
            Budget::new(8, 60_000, 10),
        )
    }

    #[tokio::test]
    async fn admits_under_warning_threshold() {
        let dir = TempDir::new().unwrap();
        let store = MaildirStore::new(dir.path());
        store.ensure_maildir("h1").await.unwrap();
        let config = BackpressureConfig {
            enabled: true,
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        let result = check(&config, &store, "h1").await.unwrap();
        assert_eq!(result.decision, BackpressureDecision::Admit);
        assert_eq!(result.pressure, 0.0);
    }

    #[tokio::test]
    async fn warns_between_threshold_and_full() {
        let dir = TempDir::new().unwrap();
        let store = MaildirStore::new(dir.path());
        store.ensure_maildir("h1").await.unwrap();
        for _ in 0..9 {
            store.deliver("h1", &envelope()).await.unwrap();
        }
        let config = BackpressureConfig {
            enabled: true,
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        let result = check(&config, &store, "h1").await.unwrap();
        assert_eq!(result.decision, BackpressureDecision::AdmitWithWarning);
        assert_eq!(result.pressure, 0.9);
    }

    #[tokio::test]
    async fn rejects_at_capacity() {
        let dir = TempDir::new().unwrap();
        let store = MaildirStore::new(dir.path());
        store.ensure_maildir("h1").await.unwrap();
        for _ in 0..10 {
            store.deliver("h1", &envelope()).await.unwrap();
        }
        let config = BackpressureConfig {
            enabled: true,
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        let result = check(&config, &store, "h1").await.unwrap();
        assert_eq!(result.decision, BackpressureDecision::Reject);
        assert_eq!(result.pressure, 1.0);
    }

    #[tokio::test]
    async fn disabled_always_admits() {
        let dir = TempDir::new().unwrap();
        let store = MaildirStore::new(dir.path());
        store.ensure_maildir("h1").await.unwrap();
        for _ in 0..20 {
            store.deliver("h1", &envelope()).await.unwrap();
        }
        let config = BackpressureConfig {
            enabled: false,
            max_mailbox_size: 10,
            pressure_warning_at: 0.8,
        };
        let result = check(&config, &store, "h1").await.unwrap();
        assert_eq!(result.decision, BackpressureDecision::Admit);
    }
}
