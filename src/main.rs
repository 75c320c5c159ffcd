use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gaffer::backend::TmuxChannelFactory;
use gaffer::config::GafferConfig;
use gaffer::executor::CheckpointExecutor;
use gaffer::governance::DraftGovernor;
use gaffer::pool::WorkerPool;
use gaffer::retry::{BreakerRegistry, RetryEngine};
use gaffer::server::{serve, AppState};
use gaffer::verify::CommandVerifier;

#[derive(Parser)]
#[command(name = "gaffer", about = "Checkpoint-driven orchestration over terminal-controlled coding agents", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool and the control server
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "gaffer.toml")]
        config: PathBuf,

        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        #[arg(default_value = "gaffer.toml")]
        path: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "gaffer=debug" } else { "gaffer=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Serve { config, bind } => run_serve(config, bind).await,
        Commands::CheckConfig { path } => check_config(path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(config_path: PathBuf, bind: Option<String>) -> gaffer::Result<()> {
    let config = GafferConfig::load(&config_path).await?;
    let bind_addr = bind.unwrap_or_else(|| config.server.bind_addr.clone());

    let factory = Arc::new(TmuxChannelFactory::new(config.backend.clone()));
    let pool = Arc::new(WorkerPool::new(config.pool.clone(), factory));
    pool.initialize().await?;

    let verifier = Arc::new(CommandVerifier::new());
    let state = AppState {
        executor: Arc::new(CheckpointExecutor::new(
            config.executor.clone(),
            CommandVerifier::new(),
        )),
        pool: Arc::clone(&pool),
        verifier,
        retries: Arc::new(RetryEngine::new(config.retry.clone())),
        breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
        governor: Arc::new(DraftGovernor::new(config.validation.clone())),
    };

    tokio::select! {
        result = serve(&bind_addr, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    pool.shutdown().await;
    Ok(())
}

async fn check_config(path: PathBuf) -> gaffer::Result<()> {
    let config = GafferConfig::load(&path).await?;
    info!(
        pool_size = config.pool.size,
        checkpoint_retry_limit = config.executor.checkpoint_retry_limit,
        resolver_retry_limit = config.executor.resolver_retry_limit,
        "configuration is valid"
    );
    Ok(())
}
