//! Execution backend adapters.
//!
//! The only channel to the external coding agent is a scraped terminal: there
//! is no exit code and no completion event. Everything fragile about that
//! (spinner heuristics, prompt-box detection, output stabilization) lives
//! behind the `CommandChannel` trait so the scheduler above it stays
//! backend-agnostic and testable against a mock.

mod mock;
mod tmux;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use mock::{MockChannel, MockChannelFactory};
pub use tmux::{TmuxChannel, TmuxChannelFactory};

use crate::error::Result;

/// Outcome of waiting for a dispatched command to settle.
#[derive(Debug, Clone)]
pub enum Quiescence {
    /// Output stopped changing and no activity indicator is visible.
    Settled { output: String },
    /// The wall-clock bound elapsed first. Callers treat this as a normal
    /// failure eligible for retry/escalation, never as a hang.
    TimedOut { last_output: String },
    /// The caller's cancellation token fired.
    Cancelled,
}

impl Quiescence {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }
}

/// One externally controlled unit of work: a terminal session bound to a
/// working directory.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Create (or recreate) the underlying session and launch the agent.
    async fn start(&self) -> Result<()>;

    /// Deliver text to the session. A successful return means only that the
    /// keystrokes were written; it proves nothing about execution.
    async fn send(&self, text: &str) -> Result<()>;

    /// Capture the current visible output.
    async fn snapshot(&self) -> Result<String>;

    /// Whether the backend session still exists.
    async fn is_alive(&self) -> bool;

    /// Whether the target execution context (window/pane) exists.
    async fn pane_exists(&self) -> bool;

    /// Poll until output settles, the timeout elapses, or `cancel` fires.
    async fn await_quiescence(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Quiescence>;

    /// Tear the session down. Destroys all session state.
    async fn kill(&self) -> Result<()>;
}

/// Creates one channel per pool slot. Restarting a worker goes through the
/// factory again so the slot gets a fresh session and checkout.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, slot: usize) -> std::sync::Arc<dyn CommandChannel>;
}
