//! Generic bounded-retry engine with exponential backoff, plus a per-operation
//! circuit breaker. The engine answers one question before any retryable
//! operation runs: is this (unit, operation) pair allowed to attempt right now?

mod breaker;

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use breaker::{BreakerRegistry, BreakerStatus, CircuitState};

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Succeeded,
    Failed,
}

/// Per-(unit, operation) retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub unit_id: String,
    pub operation: String,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: RetryStatus,
}

impl RetryState {
    fn new(unit_id: &str, operation: &str) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            operation: operation.to_string(),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            status: RetryStatus::Pending,
        }
    }
}

/// Admission decision for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryGate {
    /// Go ahead; this is attempt number `attempt` (1-based).
    Proceed { attempt: u32 },
    /// The backoff window has not elapsed yet.
    TooSoon { retry_after_secs: u64 },
    /// The retry budget is spent. Manual reset required.
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },
    /// The operation's circuit is open; no attempt was counted.
    CircuitOpen { retry_after_secs: u64 },
}

pub struct RetryEngine {
    config: RetryConfig,
    states: Mutex<HashMap<(String, String), RetryState>>,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff window after `attempts` completed attempts:
    /// `min(initial * 2^attempts, max)`.
    fn delay_after(&self, attempts: u32) -> ChronoDuration {
        let exp = self
            .config
            .initial_delay_ms
            .saturating_mul(1u64.checked_shl(attempts).unwrap_or(u64::MAX));
        ChronoDuration::milliseconds(exp.min(self.config.max_delay_ms) as i64)
    }

    /// Admit or refuse one attempt for `(unit_id, operation)`. Admission
    /// counts the attempt and stamps the clock; callers report the outcome
    /// through [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure).
    pub fn gate(&self, unit_id: &str, operation: &str) -> RetryGate {
        let mut states = self.states.lock();
        let state = states
            .entry((unit_id.to_string(), operation.to_string()))
            .or_insert_with(|| RetryState::new(unit_id, operation));

        if state.attempts >= self.config.max_retries {
            warn!(
                unit_id,
                operation,
                attempts = state.attempts,
                "retry budget exhausted"
            );
            return RetryGate::Exhausted {
                attempts: state.attempts,
                last_error: state.last_error.clone(),
            };
        }

        if let Some(last) = state.last_attempt_at {
            let delay = self.delay_after(state.attempts);
            let elapsed = Utc::now() - last;
            if elapsed < delay {
                let retry_after_secs = (delay - elapsed).num_seconds().max(1) as u64;
                debug!(unit_id, operation, retry_after_secs, "retry refused, too soon");
                return RetryGate::TooSoon { retry_after_secs };
            }
        }

        state.attempts += 1;
        state.last_attempt_at = Some(Utc::now());
        state.status = RetryStatus::Retrying;
        info!(
            unit_id,
            operation,
            attempt = state.attempts,
            max = self.config.max_retries,
            "attempt admitted"
        );
        RetryGate::Proceed {
            attempt: state.attempts,
        }
    }

    /// Like [`gate`](Self::gate), but the circuit is consulted first: an open
    /// circuit wins over every per-unit consideration and does not burn an
    /// attempt.
    pub fn gate_with_breaker(
        &self,
        breakers: &BreakerRegistry,
        unit_id: &str,
        operation: &str,
    ) -> RetryGate {
        if breakers.check(operation) == CircuitState::Open {
            return RetryGate::CircuitOpen {
                retry_after_secs: breakers.retry_after_secs(operation),
            };
        }
        self.gate(unit_id, operation)
    }

    pub fn record_success(&self, unit_id: &str, operation: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&(unit_id.to_string(), operation.to_string())) {
            state.status = RetryStatus::Succeeded;
            state.last_error = None;
        }
    }

    pub fn record_failure(&self, unit_id: &str, operation: &str, error: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&(unit_id.to_string(), operation.to_string())) {
            state.last_error = Some(error.to_string());
            state.status = if state.attempts >= self.config.max_retries {
                RetryStatus::Failed
            } else {
                RetryStatus::Pending
            };
        }
    }

    /// Whether another attempt is still in budget after a failure.
    pub fn should_retry(&self, unit_id: &str, operation: &str) -> bool {
        let states = self.states.lock();
        states
            .get(&(unit_id.to_string(), operation.to_string()))
            .map(|s| s.attempts < self.config.max_retries)
            .unwrap_or(true)
    }

    pub fn status(&self, unit_id: &str, operation: &str) -> Option<RetryState> {
        let states = self.states.lock();
        states
            .get(&(unit_id.to_string(), operation.to_string()))
            .cloned()
    }

    pub fn all_states(&self) -> Vec<RetryState> {
        self.states.lock().values().cloned().collect()
    }

    /// Clear the counters for one pair, re-admitting it immediately.
    pub fn reset(&self, unit_id: &str, operation: &str) -> bool {
        self.states
            .lock()
            .remove(&(unit_id.to_string(), operation.to_string()))
            .is_some()
    }

    pub fn reset_all(&self) {
        self.states.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_attempt(&self, unit_id: &str, operation: &str, by_ms: i64) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&(unit_id.to_string(), operation.to_string())) {
            if let Some(last) = state.last_attempt_at {
                state.last_attempt_at = Some(last - ChronoDuration::milliseconds(by_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn engine() -> RetryEngine {
        RetryEngine::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        })
    }

    #[test]
    fn test_first_attempt_proceeds() {
        let engine = engine();
        assert_eq!(
            engine.gate("task-1", "restart"),
            RetryGate::Proceed { attempt: 1 }
        );
    }

    #[test]
    fn test_immediate_reattempt_is_too_soon() {
        let engine = engine();
        engine.gate("task-1", "restart");
        engine.record_failure("task-1", "restart", "boom");

        match engine.gate("task-1", "restart") {
            RetryGate::TooSoon { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected TooSoon, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let engine = engine();
        assert_eq!(engine.delay_after(0), ChronoDuration::milliseconds(1000));
        assert_eq!(engine.delay_after(1), ChronoDuration::milliseconds(2000));
        assert_eq!(engine.delay_after(2), ChronoDuration::milliseconds(4000));
        // Capped.
        assert_eq!(engine.delay_after(10), ChronoDuration::milliseconds(30_000));
    }

    #[test]
    fn test_gate_window_doubles_on_attempt_count() {
        let engine = engine();
        engine.gate("task-1", "restart");
        engine.record_failure("task-1", "restart", "boom");

        // After one attempt the window is initial * 2^1 = 2000ms, so an
        // elapsed 1500ms is still inside it.
        engine.backdate_last_attempt("task-1", "restart", 1500);
        assert!(matches!(
            engine.gate("task-1", "restart"),
            RetryGate::TooSoon { .. }
        ));

        engine.backdate_last_attempt("task-1", "restart", 600);
        assert_eq!(
            engine.gate("task-1", "restart"),
            RetryGate::Proceed { attempt: 2 }
        );
    }

    #[test]
    fn test_exhausts_after_max_retries() {
        let engine = engine();
        for attempt in 1..=3 {
            engine.backdate_last_attempt("task-1", "restart", 60_000);
            assert_eq!(
                engine.gate("task-1", "restart"),
                RetryGate::Proceed { attempt }
            );
            engine.record_failure("task-1", "restart", "boom");
        }

        match engine.gate("task-1", "restart") {
            RetryGate::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.as_deref(), Some("boom"));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(
            engine.status("task-1", "restart").unwrap().status,
            RetryStatus::Failed
        );
    }

    #[test]
    fn test_reset_readmits_exhausted_pair() {
        let engine = engine();
        for _ in 0..3 {
            engine.backdate_last_attempt("task-1", "restart", 60_000);
            engine.gate("task-1", "restart");
            engine.record_failure("task-1", "restart", "boom");
        }
        assert!(matches!(
            engine.gate("task-1", "restart"),
            RetryGate::Exhausted { .. }
        ));

        assert!(engine.reset("task-1", "restart"));
        assert_eq!(
            engine.gate("task-1", "restart"),
            RetryGate::Proceed { attempt: 1 }
        );
    }

    #[test]
    fn test_success_marks_state_without_clearing_count() {
        let engine = engine();
        engine.gate("task-1", "restart");
        engine.record_success("task-1", "restart");

        let state = engine.status("task-1", "restart").unwrap();
        assert_eq!(state.status, RetryStatus::Succeeded);
        assert_eq!(state.attempts, 1);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_open_circuit_wins_over_fresh_retry_state() {
        let engine = engine();
        let breakers = BreakerRegistry::new(BreakerConfig {
            max_failures: 1,
            reset_timeout_secs: 300,
        });
        breakers.record_failure("restart");

        // No attempts recorded yet, but the circuit is consulted first.
        match engine.gate_with_breaker(&breakers, "task-1", "restart") {
            RetryGate::CircuitOpen { retry_after_secs } => assert!(retry_after_secs > 0),
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
        assert!(engine.status("task-1", "restart").is_none());
    }

    #[test]
    fn test_units_tracked_independently() {
        let engine = engine();
        engine.gate("task-1", "restart");
        assert_eq!(
            engine.gate("task-2", "restart"),
            RetryGate::Proceed { attempt: 1 }
        );
    }
}
