//! deferq - durable deferred-write queue
//!
//! Entry point for the deferq CLI and worker.

mod cli;
mod cmd_queue;
mod cmd_worker;

use std::sync::OnceLock;

use clap::Parser;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use deferq_config::{ConfigLoader, ConfigValidator, DeferqConfig};

use crate::cli::{Cli, Commands, WorkerAction};

/// Keeps the non-blocking file writer flushing until the process exits.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Console logging to stderr, plus a daily rolling file under
/// `{base_dir}/logs` for worker processes.
fn init_tracing(
    config: &DeferqConfig,
    log_to_file: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let file_layer = if log_to_file && config.log.file {
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("deferq")
            .filename_suffix("log")
            .max_log_files(14)
            .build(&log_dir)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);

        Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // Invalid configuration is fatal before anything touches the queue
    let config = ConfigLoader::resolve(config_path)?;

    let worker_process = matches!(
        cli.command,
        Commands::Worker {
            action: WorkerAction::Run { .. }
        } | Commands::Supervise
    );
    init_tracing(&config, worker_process)?;

    for warning in ConfigValidator::validate(&config).warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }

    match cli.command {
        Commands::Enqueue {
            priority,
            tag,
            metadata,
            fallback_direct,
            payload,
        } => {
            cmd_queue::enqueue(
                config,
                config_path,
                priority,
                tag,
                metadata,
                fallback_direct,
                payload,
            )
            .await
        }
        Commands::Worker { action } => {
            cmd_worker::handle_worker_command(action, config, config_path).await
        }
        Commands::Ensure => cmd_queue::ensure(config, config_path),
        Commands::Status { json } => cmd_queue::status(config, json),
        Commands::Replay => cmd_queue::replay(config, config_path),
        Commands::Cleanup => cmd_queue::cleanup(config),
        Commands::Supervise => cmd_queue::supervise(config, config_path).await,
    }
}
