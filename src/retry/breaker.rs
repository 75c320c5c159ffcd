use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Read-only view of one breaker for the status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub time_until_close_secs: Option<u64>,
}

/// Process-wide failure tripwire, keyed by operation name. Independent of any
/// single task's retry counters: it tracks the health of the dependency
/// itself, so that a known-broken operation is rejected immediately instead
/// of being hammered by every task that wants it.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn reset_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.reset_timeout_secs as i64)
    }

    /// Current state for `operation`, applying the open -> half-open
    /// transition when the cooldown has elapsed.
    pub fn check(&self, operation: &str) -> CircuitState {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);

        if breaker.state == CircuitState::Open {
            let elapsed = breaker
                .opened_at
                .map(|t| Utc::now() - t)
                .unwrap_or_else(ChronoDuration::zero);
            if elapsed >= self.reset_timeout() {
                breaker.state = CircuitState::HalfOpen;
                info!(operation, "circuit half-open, admitting probe call");
            }
        }

        breaker.state
    }

    /// Seconds until an open circuit admits a probe call. Zero when the
    /// circuit is not open.
    pub fn retry_after_secs(&self, operation: &str) -> u64 {
        let breakers = self.breakers.lock();
        let Some(breaker) = breakers.get(operation) else {
            return 0;
        };
        if breaker.state != CircuitState::Open {
            return 0;
        }
        let Some(opened_at) = breaker.opened_at else {
            return 0;
        };
        let close_at = opened_at + self.reset_timeout();
        (close_at - Utc::now()).num_seconds().max(0) as u64
    }

    pub fn record_success(&self, operation: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);
        if breaker.state == CircuitState::HalfOpen {
            info!(operation, "probe call succeeded, circuit closed");
        }
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    pub fn record_failure(&self, operation: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);

        breaker.consecutive_failures += 1;

        // A half-open probe failing re-opens immediately with a fresh window.
        if breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= self.config.max_failures
        {
            if breaker.state != CircuitState::Open {
                warn!(
                    operation,
                    failures = breaker.consecutive_failures,
                    "circuit opened"
                );
            }
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(operation, b)| BreakerStatus {
                operation: operation.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                opened_at: b.opened_at,
                time_until_close_secs: if b.state == CircuitState::Open {
                    b.opened_at.map(|t| {
                        ((t + self.reset_timeout()) - Utc::now()).num_seconds().max(0) as u64
                    })
                } else {
                    None
                },
            })
            .collect()
    }

    pub fn reset_all(&self) {
        self.breakers.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn force_opened_at(&self, operation: &str, opened_at: DateTime<Utc>) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(operation) {
            breaker.opened_at = Some(opened_at);
        }
    }
}
