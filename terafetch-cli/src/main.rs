//! TeraFetch CLI - Runs the chunked transfer service.
//!
//! This binary wires the library together: configuration, object store
//! client, worker pool, progress sweeper, and the HTTP API, with a
//! graceful shutdown path on Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use terafetch::api::{self, ApiState};
use terafetch::config::AppConfig;
use terafetch::dispatcher::JobDispatcher;
use terafetch::progress::{ProgressStore, DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL};
use terafetch::provider::{ObjectStore, S3ObjectStore};
use terafetch::transfer::TransferOrchestrator;

/// TeraFetch - chunked terabyte-scale downloads from object storage.
#[derive(Debug, Parser)]
#[command(name = "terafetch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the transfer service
    Serve {
        /// Path to the INI configuration file
        #[arg(long, short, value_name = "PATH")]
        config: PathBuf,

        /// Bind address override (e.g. 0.0.0.0:8080)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Parse and validate a configuration file, then exit
    CheckConfig {
        /// Path to the INI configuration file
        #[arg(long, short, value_name = "PATH")]
        config: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] terafetch::config::ConfigError),

    #[error("object store client: {0}")]
    Provider(#[from] terafetch::provider::ProviderError),

    #[error("server: {0}")]
    Server(#[from] std::io::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { config, bind } => run_serve(&config, bind),
        Commands::CheckConfig { config } => run_check_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_check_config(path: &std::path::Path) -> Result<(), CliError> {
    let config = AppConfig::from_file(path)?;
    println!(
        "ok: bucket '{}', destination {}, {} workers",
        config.object_store.bucket,
        config.destination.base_dir.display(),
        config.workers.worker_count,
    );
    Ok(())
}

fn run_serve(path: &std::path::Path, bind: Option<String>) -> Result<(), CliError> {
    let config = AppConfig::from_file(path)?;
    let bind_address = bind.unwrap_or_else(|| config.bind_address().to_string());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config, bind_address))
}

async fn serve(config: AppConfig, bind_address: String) -> Result<(), CliError> {
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(config.s3_store_config())?);
    let progress = Arc::new(ProgressStore::new());
    let orchestrator = Arc::new(TransferOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&progress),
        config.transfer_options(),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(JobDispatcher::start(
        orchestrator,
        Arc::clone(&progress),
        config.dispatcher_config(),
        shutdown.clone(),
    ));
    let sweeper = progress.spawn_sweeper(
        DEFAULT_SWEEP_INTERVAL,
        DEFAULT_RETENTION,
        shutdown.clone(),
    );

    info!(
        bucket = %config.object_store.bucket,
        base_dir = %config.destination.base_dir.display(),
        workers = config.workers.worker_count,
        "terafetch starting"
    );

    let state = ApiState {
        dispatcher: Arc::clone(&dispatcher),
        progress,
    };
    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { api::serve(state, &bind_address, shutdown).await }
    });

    tokio::select! {
        // The server only returns early on a bind or accept failure.
        result = &mut server => {
            shutdown.cancel();
            if let Ok(result) = result {
                result?;
            }
            return Err(CliError::Server(std::io::Error::other(
                "http server exited unexpectedly",
            )));
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received, draining");
            shutdown.cancel();
        }
    }

    if let Ok(result) = server.await {
        result?;
    }
    let _ = sweeper.await;
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        // Late API clones keep the Arc alive; cancellation already
        // stopped the workers, so exiting without the join is safe.
        Err(_) => info!("dispatcher handle still shared at exit"),
    }

    info!("terafetch stopped");
    Ok(())
}
