//! Checkpoint executor: drives each checkpoint through dispatch, verification,
//! bounded retries, and the two-tier escalation ladder.
//!
//! Tier one is the plain retry loop. Tier two hands the accumulated failure
//! history to a resolver pass with its own budget. Only when both tiers are
//! spent does a checkpoint become blocked, and a blocking checkpoint then
//! aborts the rest of the task rather than letting later checkpoints run on a
//! broken foundation.

mod verdict;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use verdict::{parse_verdict, Verdict};

use crate::backend::{CommandChannel, Quiescence};
use crate::config::ExecutorConfig;
use crate::error::{GafferError, Result};
use crate::task::{Checkpoint, CheckpointState, Task, TaskStatus};
use crate::verify::CommandVerifier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub checkpoint_id: String,
    pub attempt: u32,
    pub event: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub id: String,
    pub name: String,
    pub state: CheckpointState,
    pub attempts: u32,
    pub escalated: bool,
}

/// Result of running a whole task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub success: bool,
    pub checkpoints: Vec<CheckpointOutcome>,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct CheckpointExecutor {
    config: ExecutorConfig,
    verifier: CommandVerifier,
}

impl CheckpointExecutor {
    pub fn new(config: ExecutorConfig, verifier: CommandVerifier) -> Self {
        Self { config, verifier }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms)
    }

    fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.config.execute_timeout_ms)
    }

    fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.config.test_timeout_ms)
    }

    /// Run every checkpoint of `task` in order on one agent session.
    ///
    /// The task is mutated in place; the report is a summary of the final
    /// state. A blocked blocking checkpoint stops the run and leaves later
    /// checkpoints pending.
    pub async fn execute_all(
        &self,
        channel: &dyn CommandChannel,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let mut log = Vec::new();
        task.status = TaskStatus::Running;
        info!(task_id = %task.id, checkpoints = task.checkpoints.len(), "task run started");

        let mut aborted = false;
        for index in 0..task.checkpoints.len() {
            if aborted {
                break;
            }
            if cancel.is_cancelled() {
                return Err(GafferError::Cancelled("task run cancelled".to_string()));
            }

            self.run_checkpoint_inner(channel, &mut task.checkpoints[index], cancel, &mut log)
                .await?;

            let cp = &task.checkpoints[index];
            if cp.state == CheckpointState::Blocked && cp.blocking {
                error!(
                    task_id = %task.id,
                    checkpoint = %cp.name,
                    "blocking checkpoint blocked, aborting remaining checkpoints"
                );
                aborted = true;
            }
        }

        let passed = count_state(task, CheckpointState::Passed);
        let blocked = count_state(task, CheckpointState::Blocked);
        let failed = task
            .checkpoints
            .iter()
            .filter(|c| matches!(c.state, CheckpointState::Failed | CheckpointState::Escalated))
            .count();
        let success = passed == task.checkpoints.len();

        task.status = if success {
            TaskStatus::Completed
        } else if aborted || blocked > 0 {
            TaskStatus::Blocked
        } else {
            TaskStatus::Failed
        };

        info!(
            task_id = %task.id,
            passed,
            blocked,
            success,
            "task run finished"
        );

        Ok(RunReport {
            task_id: task.id.clone(),
            total: task.checkpoints.len(),
            passed,
            failed,
            blocked,
            success,
            checkpoints: task
                .checkpoints
                .iter()
                .map(|c| CheckpointOutcome {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    state: c.state,
                    attempts: c.attempts,
                    escalated: c.escalated,
                })
                .collect(),
            log,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run a single checkpoint through both tiers.
    pub async fn run_checkpoint(
        &self,
        channel: &dyn CommandChannel,
        checkpoint: &mut Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<Vec<LogEntry>> {
        let mut log = Vec::new();
        self.run_checkpoint_inner(channel, checkpoint, cancel, &mut log)
            .await?;
        Ok(log)
    }

    async fn run_checkpoint_inner(
        &self,
        channel: &dyn CommandChannel,
        cp: &mut Checkpoint,
        cancel: &CancellationToken,
        log: &mut Vec<LogEntry>,
    ) -> Result<()> {
        info!(checkpoint = %cp.name, "checkpoint started");

        // Tier one: the plain retry loop.
        while cp.attempts < self.config.checkpoint_retry_limit {
            if cancel.is_cancelled() {
                return Err(GafferError::Cancelled("task run cancelled".to_string()));
            }
            if cp.attempts > 0 {
                tokio::time::sleep(self.retry_delay()).await;
                cp.transition(CheckpointState::Retrying)?;
            }
            cp.attempts += 1;
            cp.transition(CheckpointState::Executing)?;
            push_log(log, cp, "executing");

            match self.dispatch_and_settle(channel, cp, cancel).await? {
                Ok(()) => {}
                Err(reason) => {
                    warn!(checkpoint = %cp.name, attempt = cp.attempts, %reason, "dispatch failed");
                    cp.record_test(false, &reason);
                    cp.transition(CheckpointState::Failed)?;
                    push_log(log, cp, format!("failed: {}", reason));
                    continue;
                }
            }

            cp.transition(CheckpointState::Testing)?;
            let verdict = self.test_checkpoint(channel, cp, cancel).await?;
            cp.record_test(verdict.passed, &verdict.reason);

            if verdict.passed {
                cp.transition(CheckpointState::Passed)?;
                push_log(log, cp, format!("passed: {}", verdict.reason));
                info!(checkpoint = %cp.name, attempt = cp.attempts, "checkpoint passed");
                return Ok(());
            }

            cp.transition(CheckpointState::Failed)?;
            push_log(log, cp, format!("failed: {}", verdict.reason));
            warn!(
                checkpoint = %cp.name,
                attempt = cp.attempts,
                limit = self.config.checkpoint_retry_limit,
                reason = %verdict.reason,
                "checkpoint attempt failed"
            );
        }

        // Tier two: hand the failure history to the resolver.
        cp.transition(CheckpointState::Escalated)?;
        push_log(log, cp, "escalated to resolver");
        warn!(checkpoint = %cp.name, "retry budget spent, escalating");

        for resolver_attempt in 1..=self.config.resolver_retry_limit {
            if cancel.is_cancelled() {
                return Err(GafferError::Cancelled("task run cancelled".to_string()));
            }
            if resolver_attempt > 1 {
                // The resolver gets a longer breather than the inner loop.
                tokio::time::sleep(self.retry_delay() * 2).await;
            }
            cp.attempts += 1;
            push_log(log, cp, format!("resolver attempt {}", resolver_attempt));

            let prompt = self.resolver_prompt(cp);
            if let Err(reason) = self.send_and_settle(channel, &prompt, cancel).await? {
                cp.record_test(false, &reason);
                continue;
            }

            let verdict = self.test_checkpoint(channel, cp, cancel).await?;
            cp.record_test(verdict.passed, &verdict.reason);

            if verdict.passed {
                cp.transition(CheckpointState::Passed)?;
                push_log(log, cp, format!("passed after escalation: {}", verdict.reason));
                info!(checkpoint = %cp.name, resolver_attempt, "resolver recovered checkpoint");
                return Ok(());
            }

            if verdict.reason.contains("BLOCKED") {
                break;
            }
        }

        cp.transition(CheckpointState::Blocked)?;
        push_log(log, cp, "blocked, human intervention required");
        error!(checkpoint = %cp.name, attempts = cp.attempts, "checkpoint blocked");
        Ok(())
    }

    /// Dispatch the checkpoint's instructions and wait for the session to
    /// settle. Returns `Ok(Err(reason))` on any verification or settling
    /// failure so the caller can treat it as a normal retryable outcome.
    async fn dispatch_and_settle(
        &self,
        channel: &dyn CommandChannel,
        cp: &Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), String>> {
        let prompt = self.execute_prompt(cp);
        let report = self.verifier.send_and_verify(channel, &prompt).await?;
        if !report.executed {
            return Ok(Err(format!(
                "dispatch not confirmed ({})",
                report.failure_summary()
            )));
        }

        match channel.await_quiescence(self.execute_timeout(), cancel).await? {
            Quiescence::Settled { .. } => Ok(Ok(())),
            Quiescence::TimedOut { .. } => Ok(Err("execution window timed out".to_string())),
            Quiescence::Cancelled => Err(GafferError::Cancelled("task run cancelled".to_string())),
        }
    }

    async fn send_and_settle(
        &self,
        channel: &dyn CommandChannel,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), String>> {
        if let Err(e) = channel.send(prompt).await {
            return Ok(Err(format!("send failed: {}", e)));
        }
        match channel.await_quiescence(self.execute_timeout(), cancel).await? {
            Quiescence::Settled { .. } => Ok(Ok(())),
            Quiescence::TimedOut { .. } => Ok(Err("resolver window timed out".to_string())),
            Quiescence::Cancelled => Err(GafferError::Cancelled("task run cancelled".to_string())),
        }
    }

    /// Ask the agent to verify the checkpoint's pass criteria and parse its
    /// verdict. A timeout or a missing marker is a FAIL, never a pass.
    pub async fn test_checkpoint(
        &self,
        channel: &dyn CommandChannel,
        cp: &Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        let prompt = self.test_prompt(cp);
        channel.send(&prompt).await?;

        let output = match channel.await_quiescence(self.test_timeout(), cancel).await? {
            Quiescence::Settled { output } => output,
            Quiescence::TimedOut { .. } => {
                return Ok(Verdict {
                    passed: false,
                    reason: "verification timed out".to_string(),
                })
            }
            Quiescence::Cancelled => return Err(GafferError::Cancelled("task run cancelled".to_string())),
        };

        Ok(parse_verdict(&output))
    }

    fn execute_prompt(&self, cp: &Checkpoint) -> String {
        format!(
            "## Checkpoint: {}\n\nObjective: {}\n\n{}\n\nWork on this checkpoint only. \
             Do not start anything beyond its scope.",
            cp.name, cp.objective, cp.instructions
        )
    }

    fn test_prompt(&self, cp: &Checkpoint) -> String {
        let criteria = cp
            .pass_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Verify checkpoint \"{}\". Check each criterion:\n{}\n\n\
             Respond with exactly one line:\n\
             TEST_PASS: [reason]\n\
             or\n\
             TEST_FAIL: [reason]",
            cp.name, criteria
        )
    }

    fn resolver_prompt(&self, cp: &Checkpoint) -> String {
        let failures = cp.failure_history();
        let history = failures
            .iter()
            .map(|r| format!("- attempt {}: {}", r.attempt, r.message))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Checkpoint \"{}\" has failed {} times. Objective: {}\n\n\
             Failure history:\n{}\n\n\
             Diagnose the root cause and fix it. If the checkpoint cannot be \
             completed at all, say BLOCKED and explain why.",
            cp.name,
            failures.len(),
            cp.objective,
            history
        )
    }
}

fn count_state(task: &Task, state: CheckpointState) -> usize {
    task.checkpoints.iter().filter(|c| c.state == state).count()
}

fn push_log(log: &mut Vec<LogEntry>, cp: &Checkpoint, event: impl Into<String>) {
    log.push(LogEntry {
        timestamp: Utc::now(),
        checkpoint_id: cp.id.clone(),
        attempt: cp.attempts,
        event: event.into(),
    });
}
