//! Task and checkpoint domain model.
//!
//! A task is an ordered list of checkpoints; a checkpoint is the atomic unit
//! of dispatch, verification, and retry. Checkpoint state changes go through
//! [`Checkpoint::transition`], which enforces the allowed-transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GafferError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Executing,
    Testing,
    Passed,
    Failed,
    Retrying,
    Escalated,
    Blocked,
}

impl CheckpointState {
    /// States reachable from `self`. Terminal states return an empty slice.
    pub fn allowed_transitions(&self) -> &'static [CheckpointState] {
        use CheckpointState::*;
        match self {
            Pending => &[Executing],
            Executing => &[Testing, Failed],
            Testing => &[Passed, Failed],
            Failed => &[Retrying, Escalated],
            Retrying => &[Executing],
            Escalated => &[Passed, Blocked],
            Passed | Blocked => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Testing => "testing",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Escalated => "escalated",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// One verification outcome, kept as an append-only log on the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub attempt: u32,
    pub passed: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    pub objective: String,
    /// Instructions dispatched verbatim to the agent.
    pub instructions: String,
    /// Criteria the verification prompt asks the agent to check.
    pub pass_criteria: Vec<String>,
    /// Whether a blocked outcome aborts the rest of the task.
    pub blocking: bool,
    pub state: CheckpointState,
    pub attempts: u32,
    /// Set once the escalation tier has been entered, even if it later passes.
    pub escalated: bool,
    pub test_results: Vec<TestResult>,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: format!("cp_{}", Uuid::new_v4()),
            name: name.into(),
            objective: objective.into(),
            instructions: String::new(),
            pass_criteria: Vec::new(),
            blocking: true,
            state: CheckpointState::Pending,
            attempts: 0,
            escalated: false,
            test_results: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_pass_criteria(mut self, criteria: Vec<String>) -> Self {
        self.pass_criteria = criteria;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Move to `next`, rejecting anything outside the transition table.
    pub fn transition(&mut self, next: CheckpointState) -> Result<()> {
        let allowed = self.state.allowed_transitions();
        if !allowed.contains(&next) {
            return Err(GafferError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
                allowed: allowed
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        if next == CheckpointState::Escalated {
            self.escalated = true;
        }
        self.state = next;
        Ok(())
    }

    pub fn record_test(&mut self, passed: bool, message: impl Into<String>) {
        self.test_results.push(TestResult {
            attempt: self.attempts,
            passed,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    /// Failure messages in order, for escalation prompts.
    pub fn failure_history(&self) -> Vec<&TestResult> {
        self.test_results.iter().filter(|r| !r.passed).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub objective: String,
    pub deliverables: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", Uuid::new_v4()),
            title: title.into(),
            objective: objective.into(),
            deliverables: Vec::new(),
            checkpoints: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<Checkpoint>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_deliverables(mut self, deliverables: Vec<String>) -> Self {
        self.deliverables = deliverables;
        self
    }
}
