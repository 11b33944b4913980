// SPDX-License-Identifier: MIT
//! Per-endpoint circuit breaker (spec.md §3.5, §4.9), generalizing the
//! teacher's single named `CircuitBreaker` into a hash-keyed manager: one
//! state machine per endpoint hash.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::envelope::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_ms: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: i64,
    /// Set while HALF_OPEN has let exactly one caller through; blocks every
    /// other caller until that probe reports success or failure.
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: 0,
            probe_in_flight: false,
        }
    }
}

/// Tracks one breaker per endpoint hash. Lock scope is a single hash-map
/// entry at a time; never held across an await point.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a delivery attempt to `endpoint_hash` should proceed right
    /// now. OPEN transitions to HALF_OPEN once the cooldown has elapsed and
    /// admits exactly one probe; every other caller is rejected until that
    /// probe resolves (spec.md §4.9: "allow a single probe").
    pub fn allow(&self, endpoint_hash: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(endpoint_hash.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                if now_ms() - breaker.opened_at >= self.config.cooldown_ms {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, endpoint_hash: &str) {
        if !self.config.enabled {
            return;
        }
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(endpoint_hash.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Closed;
                breaker.consecutive_failures = 0;
                breaker.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, endpoint_hash: &str) {
        if !self.config.enabled {
            return;
        }
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(endpoint_hash.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = now_ms();
                }
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = now_ms();
                breaker.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, endpoint_hash: &str) -> CircuitState {
        self.breakers
            .lock()
            .unwrap()
            .get(endpoint_hash)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }
}
