mod settings;

pub use settings::{
    BackendConfig, BreakerConfig, ExecutorConfig, GafferConfig, PoolConfig, RetryConfig,
    ServerConfig, ValidationConfig,
};
