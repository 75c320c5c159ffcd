use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChannelFactory, CommandChannel, Quiescence};
use crate::config::BackendConfig;
use crate::error::{GafferError, Result};

/// Terminal session driven through tmux. One session per worker slot.
pub struct TmuxChannel {
    session: String,
    workdir: PathBuf,
    config: BackendConfig,
}

impl TmuxChannel {
    pub fn new(session: impl Into<String>, workdir: impl Into<PathBuf>, config: BackendConfig) -> Self {
        Self {
            session: session.into(),
            workdir: workdir.into(),
            config,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    async fn tmux(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| GafferError::Backend(format!("tmux spawn failed: {}", e)))?;

        if !output.status.success() {
            return Err(GafferError::Backend(format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn tmux_ok(&self, args: &[&str]) -> bool {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Heuristic "still working" detection over the last few visible lines.
    /// The agent shows a spinner and a token counter while it thinks, and a
    /// bordered prompt box when it is ready for input.
    fn is_processing(output: &str) -> bool {
        let tail: Vec<&str> = output.trim().lines().rev().take(5).collect();
        let tail = tail.join("\n");

        let thinking = tail.contains('✻') || tail.contains("tokens · esc to interrupt");
        if thinking {
            return true;
        }

        let ready = tail.contains("bypass permissions")
            || tail.contains("shift+tab to cycle")
            || (tail.contains('>') && tail.contains('│'));

        !ready
    }

    fn escape(text: &str) -> String {
        text.replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
    }
}

#[async_trait]
impl CommandChannel for TmuxChannel {
    async fn start(&self) -> Result<()> {
        // Stale session with the same name means a previous worker died
        // without cleanup.
        if self.tmux_ok(&["has-session", "-t", &self.session]).await {
            warn!(session = %self.session, "killing stale session before start");
            let _ = self.tmux(&["kill-session", "-t", &self.session]).await;
        }

        let workdir = self.workdir.to_string_lossy().into_owned();
        tokio::fs::create_dir_all(&self.workdir).await?;

        self.tmux(&["new-session", "-d", "-s", &self.session, "-c", &workdir])
            .await?;
        self.tmux(&[
            "send-keys",
            "-t",
            &self.session,
            &self.config.agent_command,
            "Enter",
        ])
        .await?;

        tokio::time::sleep(Duration::from_millis(self.config.startup_delay_ms)).await;
        debug!(session = %self.session, "agent session started");
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.is_alive().await {
            return Err(GafferError::Backend(format!(
                "session {} is not alive",
                self.session
            )));
        }

        // Text first, Enter separately: sending both in one call loses the
        // trailing newline when the agent's input box is mid-render.
        let escaped = Self::escape(text);
        self.tmux(&["send-keys", "-t", &self.session, &escaped])
            .await?;
        tokio::time::sleep(Duration::from_millis(self.config.key_delay_ms)).await;
        self.tmux(&["send-keys", "-t", &self.session, "Enter"])
            .await?;

        Ok(())
    }

    async fn snapshot(&self) -> Result<String> {
        let lines = format!("-{}", self.config.capture_lines);
        self.tmux(&["capture-pane", "-t", &self.session, "-p", "-S", &lines])
            .await
    }

    async fn is_alive(&self) -> bool {
        self.tmux_ok(&["has-session", "-t", &self.session]).await
    }

    async fn pane_exists(&self) -> bool {
        self.tmux_ok(&["list-panes", "-t", &self.session]).await
    }

    async fn await_quiescence(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Quiescence> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_output = String::new();
        let mut stable_polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(Quiescence::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Quiescence::TimedOut { last_output });
            }

            let output = self.snapshot().await?;

            if !Self::is_processing(&output) {
                // Require the output to hold still across consecutive polls;
                // the agent sometimes pauses between tool invocations.
                if output == last_output {
                    stable_polls += 1;
                } else {
                    stable_polls = 0;
                }
                if stable_polls >= self.config.quiescence_stable_polls {
                    return Ok(Quiescence::Settled { output });
                }
            } else {
                stable_polls = 0;
            }

            last_output = output;

            tokio::select! {
                () = cancel.cancelled() => return Ok(Quiescence::Cancelled),
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn kill(&self) -> Result<()> {
        if self.tmux_ok(&["has-session", "-t", &self.session]).await {
            self.tmux(&["kill-session", "-t", &self.session]).await?;
        }
        debug!(session = %self.session, "session killed");
        Ok(())
    }
}

/// Builds one tmux channel per pool slot, each with its own session name and
/// checkout directory.
pub struct TmuxChannelFactory {
    config: BackendConfig,
}

impl TmuxChannelFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for TmuxChannelFactory {
    fn create(&self, slot: usize) -> Arc<dyn CommandChannel> {
        let session = format!("{}-{}", self.config.session_prefix, slot);
        let workdir = PathBuf::from(&self.config.workspace_dir).join(format!("worker-{}", slot));
        Arc::new(TmuxChannel::new(session, workdir, self.config.clone()))
    }
}
