// SPDX-License-Identifier: MIT
//! Sliding-window per-sender rate limiting (spec.md §3.5, §4.8). Backed by
//! the index's count-in-window query rather than an in-memory counter, so
//! the limit survives a restart.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::RelayIndex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_per_window: i64,
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_window: 100,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    Reject,
}

/// Checked once per publish, before fan-out.
pub async fn check(config: &RateLimitConfig, index: &RelayIndex, sender: &str) -> Result<RateLimitDecision> {
    if !config.enabled {
        return Ok(RateLimitDecision::Allow);
    }
    let since = Utc::now() - ChronoDuration::seconds(config.window_secs);
    let count = index.count_sender_in_window(sender, &since.to_rfc3339()).await?;
    if count >= config.max_per_window {
        Ok(RateLimitDecision::Reject)
    } else {
        Ok(RateLimitDecision::Allow)
    }
}
