// SPDX-License-Identifier: MIT
//! The durable unit of delivery (spec.md §3.2) and its self-limiting budget.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Self-limiting counters carried with each envelope: hops, TTL, call
/// budget, ancestor chain (spec.md §3.2, §4.11).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_hops: u32,
    pub hop_count: u32,
    /// Epoch milliseconds, absolute.
    pub ttl: i64,
    pub call_budget_remaining: i64,
    pub ancestor_chain: Vec<String>,
}

impl Budget {
    pub fn new(max_hops: u32, ttl_ms_from_now: i64, call_budget: i64) -> Self {
        Self {
            max_hops,
            hop_count: 0,
            ttl: now_ms() + ttl_ms_from_now,
            call_budget_remaining: call_budget,
            ancestor_chain: Vec::new(),
        }
    }

    /// Rewrite after successful delivery to `endpoint_subject`: increments
    /// hops, decrements call budget, appends to the ancestor chain. This is
    /// the form subscribers observe (spec.md §4.11).
    pub fn advance(&self, endpoint_subject: &str) -> Budget {
        let mut next = self.clone();
        next.hop_count += 1;
        next.call_budget_remaining -= 1;
        next.ancestor_chain.push(endpoint_subject.to_string());
        next
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Durable unit of delivery (spec.md §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Monotonic ULID, 26 chars, unique across the process lifetime.
    pub id: String,
    pub subject: String,
    pub from: String,
    pub reply_to: Option<String>,
    /// ISO-8601 timestamp.
    pub created_at: String,
    pub payload: serde_json::Value,
    pub budget: Budget,
}

impl Envelope {
    pub fn new(
        subject: String,
        from: String,
        reply_to: Option<String>,
        payload: serde_json::Value,
        budget: Budget,
    ) -> Self {
        Self {
            id: new_id(),
            subject,
            from,
            reply_to,
            created_at: chrono::Utc::now().to_rfc3339(),
            payload,
            budget,
        }
    }

    /// On-disk / index filename stem: `<createdAtMs>.<ulid>.<hostPid>`
    /// (spec.md §3.4). The same name is used through every rename so the
    /// envelope is trackable across `tmp/`, `new/`, `cur/`, `failed/`.
    pub fn file_name(&self) -> String {
        format!("{}.{}.{}", now_ms(), self.id, std::process::id())
    }
}

/// Generate a new monotonic ULID string (envelope id).
pub fn new_id() -> String {
    Ulid::new().to_string()
}
