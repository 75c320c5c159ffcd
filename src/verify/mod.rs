//! Command delivery verification.
//!
//! "The send call returned success" proves nothing on a scraped terminal.
//! This module is the sole safeguard against silently assuming work happened:
//! it confirms the session is alive, the pane exists, the visible output
//! actually changed, and (where the terminal cooperates) the command text
//! itself round-tripped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::CommandChannel;
use crate::error::Result;

/// The individual confirmation checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyCheck {
    Liveness,
    Pane,
    OutputDelta,
    Echo,
}

impl std::fmt::Display for VerifyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Liveness => write!(f, "liveness"),
            Self::Pane => write!(f, "pane"),
            Self::OutputDelta => write!(f, "output-delta"),
            Self::Echo => write!(f, "echo"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReason {
    pub check: VerifyCheck,
    pub passed: bool,
    pub message: String,
}

/// Result of a verified send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// True only when liveness, pane, and output-delta all passed. The echo
    /// check is advisory: terminal wrapping mangles long command lines, so
    /// a missing echo downgrades to a reason rather than a veto.
    pub executed: bool,
    /// Output that appeared after the send, relative to the pre-send snapshot.
    pub output_delta: String,
    pub reasons: Vec<CheckReason>,
}

impl VerifyReport {
    fn not_executed(check: VerifyCheck, message: impl Into<String>) -> Self {
        Self {
            executed: false,
            output_delta: String::new(),
            reasons: vec![CheckReason {
                check,
                passed: false,
                message: message.into(),
            }],
        }
    }

    pub fn failure_summary(&self) -> String {
        self.reasons
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.check, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Session exists.
    pub healthy: bool,
    /// Session answered the tagged no-op within the probe window.
    pub responsive: bool,
}

#[derive(Debug, Clone)]
pub struct CommandVerifier {
    /// Pause between send and the post-send snapshot.
    settle: Duration,
    /// Command-prefix length used for the echo check.
    echo_prefix_len: usize,
    /// Polls and interval for the health probe.
    probe_polls: u32,
    probe_interval: Duration,
}

impl Default for CommandVerifier {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            echo_prefix_len: 50,
            probe_polls: 5,
            probe_interval: Duration::from_millis(500),
        }
    }
}

impl CommandVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Send `command` and independently confirm it was delivered.
    pub async fn send_and_verify(
        &self,
        channel: &dyn CommandChannel,
        command: &str,
    ) -> Result<VerifyReport> {
        if !channel.is_alive().await {
            warn!("send aborted: backend session is not alive");
            return Ok(VerifyReport::not_executed(
                VerifyCheck::Liveness,
                "backend session does not exist",
            ));
        }
        if !channel.pane_exists().await {
            warn!("send aborted: target pane missing");
            return Ok(VerifyReport::not_executed(
                VerifyCheck::Pane,
                "target execution context does not exist",
            ));
        }

        let before = channel.snapshot().await?;
        channel.send(command).await?;
        tokio::time::sleep(self.settle).await;
        let after = channel.snapshot().await?;

        let mut reasons = vec![
            CheckReason {
                check: VerifyCheck::Liveness,
                passed: true,
                message: "session alive".to_string(),
            },
            CheckReason {
                check: VerifyCheck::Pane,
                passed: true,
                message: "pane present".to_string(),
            },
        ];

        let delta = output_delta(&before, &after);
        let delta_passed = !delta.trim().is_empty();
        reasons.push(CheckReason {
            check: VerifyCheck::OutputDelta,
            passed: delta_passed,
            message: if delta_passed {
                format!("{} new bytes observed", delta.len())
            } else {
                "output unchanged after send".to_string()
            },
        });

        let prefix: String = command.chars().take(self.echo_prefix_len).collect();
        let prefix = prefix.lines().next().unwrap_or("").trim().to_string();
        let echo_passed = !prefix.is_empty() && after.contains(&prefix);
        reasons.push(CheckReason {
            check: VerifyCheck::Echo,
            passed: echo_passed,
            message: if echo_passed {
                "command text observed in output".to_string()
            } else {
                "command echo not observed (terminal may wrap long input)".to_string()
            },
        });

        let executed = delta_passed;
        debug!(executed, echo = echo_passed, "send verified");

        Ok(VerifyReport {
            executed,
            output_delta: delta,
            reasons,
        })
    }

    /// Send a uniquely tagged no-op and confirm the tag round-trips.
    pub async fn monitor_health(&self, channel: &dyn CommandChannel) -> HealthProbe {
        if !channel.is_alive().await {
            return HealthProbe {
                healthy: false,
                responsive: false,
            };
        }

        let tag = format!("gaffer-probe-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        if channel.send(&format!("echo {}", tag)).await.is_err() {
            return HealthProbe {
                healthy: true,
                responsive: false,
            };
        }

        for _ in 0..self.probe_polls {
            tokio::time::sleep(self.probe_interval).await;
            if let Ok(output) = channel.snapshot().await {
                if output.contains(&tag) {
                    return HealthProbe {
                        healthy: true,
                        responsive: true,
                    };
                }
            }
        }

        warn!(tag, "health probe tag never appeared");
        HealthProbe {
            healthy: true,
            responsive: false,
        }
    }
}

/// New output relative to a prior snapshot. Scrollback means `after` usually
/// extends `before`; when the screen scrolled or redrew, fall back to the
/// longest common prefix.
fn output_delta(before: &str, after: &str) -> String {
    if let Some(rest) = after.strip_prefix(before) {
        return rest.to_string();
    }
    let common = before
        .bytes()
        .zip(after.bytes())
        .take_while(|(b, a)| b == a)
        .count();
    // Avoid splitting a UTF-8 sequence.
    let mut boundary = common;
    while boundary > 0 && !after.is_char_boundary(boundary) {
        boundary -= 1;
    }
    after[boundary..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockChannel;

    fn quick_verifier() -> CommandVerifier {
        CommandVerifier::new().with_settle(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_verified_send_passes_all_checks() {
        let channel = MockChannel::new();
        let report = quick_verifier()
            .send_and_verify(&channel, "touch done.txt")
            .await
            .unwrap();

        assert!(report.executed);
        assert!(report.reasons.iter().all(|r| r.passed));
        assert!(report.output_delta.contains("touch done.txt"));
    }

    #[tokio::test]
    async fn test_dead_session_is_not_executed() {
        let channel = MockChannel::new();
        channel.set_alive(false);

        let report = quick_verifier()
            .send_and_verify(&channel, "ls")
            .await
            .unwrap();

        assert!(!report.executed);
        assert_eq!(report.reasons[0].check, VerifyCheck::Liveness);
        assert_eq!(channel.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_pane_is_not_executed() {
        let channel = MockChannel::new();
        channel.set_pane(false);

        let report = quick_verifier()
            .send_and_verify(&channel, "ls")
            .await
            .unwrap();

        assert!(!report.executed);
        assert_eq!(report.reasons[0].check, VerifyCheck::Pane);
    }

    #[tokio::test]
    async fn test_echo_failure_does_not_veto_when_delta_passed() {
        let channel = MockChannel::new();
        channel.suppress_echo();

        let report = quick_verifier()
            .send_and_verify(&channel, "a very long command line")
            .await
            .unwrap();

        assert!(report.executed);
        let echo = report
            .reasons
            .iter()
            .find(|r| r.check == VerifyCheck::Echo)
            .unwrap();
        assert!(!echo.passed);
    }

    #[tokio::test]
    async fn test_health_probe_round_trips_tag() {
        let channel = MockChannel::new();
        let verifier = CommandVerifier {
            probe_interval: Duration::from_millis(1),
            ..CommandVerifier::default()
        };

        let probe = verifier.monitor_health(&channel).await;
        // The mock echoes sends onto its screen, so the tag is visible.
        assert!(probe.healthy);
        assert!(probe.responsive);
    }

    #[tokio::test]
    async fn test_health_probe_dead_session() {
        let channel = MockChannel::new();
        channel.set_alive(false);

        let verifier = CommandVerifier {
            probe_interval: Duration::from_millis(1),
            ..CommandVerifier::default()
        };
        let probe = verifier.monitor_health(&channel).await;
        assert!(!probe.healthy);
        assert!(!probe.responsive);
    }

    #[test]
    fn test_output_delta_suffix() {
        assert_eq!(output_delta("abc", "abcdef"), "def");
    }

    #[test]
    fn test_output_delta_redraw_falls_back_to_common_prefix() {
        assert_eq!(output_delta("abcXYZ", "abc123"), "123");
    }
}
