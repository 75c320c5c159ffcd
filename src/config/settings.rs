use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{GafferError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GafferConfig {
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub backend: BackendConfig,
    pub validation: ValidationConfig,
    pub server: ServerConfig,
}

impl GafferConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| GafferError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.executor.checkpoint_retry_limit == 0 {
            errors.push("executor.checkpoint_retry_limit must be greater than 0");
        }
        if self.executor.resolver_retry_limit == 0 {
            errors.push("executor.resolver_retry_limit must be greater than 0");
        }
        if self.executor.test_timeout_ms == 0 {
            errors.push("executor.test_timeout_ms must be greater than 0");
        }

        if self.retry.max_retries == 0 {
            errors.push("retry.max_retries must be greater than 0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }

        if self.breaker.max_failures == 0 {
            errors.push("breaker.max_failures must be greater than 0");
        }
        if self.breaker.reset_timeout_secs == 0 {
            errors.push("breaker.reset_timeout_secs must be greater than 0");
        }

        if self.pool.size == 0 {
            errors.push("pool.size must be greater than 0");
        }
        if self.pool.acquire_timeout_ms == 0 {
            errors.push("pool.acquire_timeout_ms must be greater than 0");
        }

        if self.backend.poll_interval_ms == 0 {
            errors.push("backend.poll_interval_ms must be greater than 0");
        }
        if self.backend.quiescence_stable_polls == 0 {
            errors.push("backend.quiescence_stable_polls must be greater than 0");
        }
        if self.backend.capture_lines == 0 {
            errors.push("backend.capture_lines must be greater than 0");
        }

        if self.validation.required_sections.is_empty() {
            errors.push("validation.required_sections must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GafferError::Config(errors.join("; ")))
        }
    }
}

/// Checkpoint executor tuning. Defaults mirror the retry/escalation bounds
/// the rest of the system is calibrated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Execute+test cycles per checkpoint before escalating.
    pub checkpoint_retry_limit: u32,
    /// Resolver attempts after escalation before the checkpoint is blocked.
    pub resolver_retry_limit: u32,
    /// Fixed delay between checkpoint retry cycles.
    pub retry_delay_ms: u64,
    /// Wall-clock bound on a single pass/fail test.
    pub test_timeout_ms: u64,
    /// Wall-clock bound on waiting for a dispatched instruction to settle.
    pub execute_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            checkpoint_retry_limit: 3,
            resolver_retry_limit: 5,
            retry_delay_ms: 2000,
            test_timeout_ms: 30_000,
            execute_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// Cooldown before an open circuit admits a probe call.
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker sessions the pool owns.
    pub size: usize,
    /// Upper bound on waiting for an idle worker.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            acquire_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Prefix for terminal session names.
    pub session_prefix: String,
    /// Root directory for per-worker checkouts.
    pub workspace_dir: String,
    /// Command that launches the coding agent inside the session.
    pub agent_command: String,
    /// Scrollback lines captured per snapshot.
    pub capture_lines: u32,
    /// Polling interval while waiting for output to settle.
    pub poll_interval_ms: u64,
    /// Consecutive unchanged snapshots required to call the output settled.
    pub quiescence_stable_polls: u32,
    /// Grace period after launching the agent before it accepts input.
    pub startup_delay_ms: u64,
    /// Pause between sending command text and the terminating Enter.
    pub key_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            session_prefix: "gaffer".to_string(),
            workspace_dir: "/workspace".to_string(),
            agent_command: "claude --dangerously-skip-permissions".to_string(),
            capture_lines: 500,
            poll_interval_ms: 5000,
            quiescence_stable_polls: 2,
            startup_delay_ms: 3000,
            key_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Sections a draft must contain to pass the structural check.
    pub required_sections: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_sections: vec![
                "## Task:".to_string(),
                "## Acceptance Criteria:".to_string(),
                "## Technical Details:".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}
