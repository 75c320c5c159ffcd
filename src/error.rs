use thiserror::Error;

#[derive(Error, Debug)]
pub enum GafferError {
    #[error("Invalid state transition: {from} -> {to} (allowed: {allowed})")]
    InvalidStateTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Draft not found: {0}")]
    DraftNotFound(String),

    #[error("Another draft is active: {id} is in state '{state}'")]
    ActiveDraftExists { id: String, state: String },

    #[error("Draft {id} is frozen in state '{state}'; content can only change in state 'draft'")]
    DraftFrozen { id: String, state: String },

    #[error("Merge requires a named approver")]
    ApproverRequired,

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker pool saturated: no worker became idle within {waited_ms}ms")]
    PoolSaturated { waited_ms: u64 },

    #[error("Circuit open for operation '{operation}', retry after {retry_after_secs}s")]
    CircuitOpen {
        operation: String,
        retry_after_secs: u64,
    },

    #[error("Retry budget exhausted for {unit_id}/{operation} after {attempts} attempts")]
    RetryExhausted {
        unit_id: String,
        operation: String,
        attempts: u32,
    },

    #[error("Too soon to retry {unit_id}/{operation}: wait {retry_after_secs}s")]
    RetryTooSoon {
        unit_id: String,
        operation: String,
        retry_after_secs: u64,
    },

    #[error("Backend session error: {0}")]
    Backend(String),

    #[error("Command delivery not confirmed: {0}")]
    Verification(String),

    #[error("Checkpoint blocked: {0}")]
    CheckpointBlocked(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, GafferError>;
