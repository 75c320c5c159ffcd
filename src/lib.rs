pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod governance;
pub mod pool;
pub mod retry;
pub mod server;
pub mod task;
pub mod verify;

pub use backend::{ChannelFactory, CommandChannel, MockChannel, Quiescence, TmuxChannel};
pub use config::GafferConfig;
pub use error::{GafferError, Result};
pub use executor::{CheckpointExecutor, RunReport};
pub use governance::{Draft, DraftGovernor, DraftState};
pub use pool::{WorkerLease, WorkerPool};
pub use retry::{BreakerRegistry, CircuitState, RetryEngine, RetryGate};
pub use task::{Checkpoint, CheckpointState, Task, TaskStatus, TestResult};
pub use verify::{CommandVerifier, HealthProbe, VerifyReport};
