//! CLI definitions for deferq.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use deferq_queue::DEFAULT_PRIORITY;

/// deferq CLI.
#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Durable deferred-write queue with a self-supervising worker")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DEFERQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Queue a write for the worker
    Enqueue {
        /// Priority, 1 (highest) to 10
        #[arg(short, long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,

        /// Operation tag recorded with the entry
        #[arg(short, long, default_value = "")]
        tag: String,

        /// Metadata as key=value (repeatable)
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Execute directly against the store when the queue is unavailable
        #[arg(long)]
        fallback_direct: bool,

        /// Payload; read from stdin when omitted
        payload: Option<String>,
    },

    /// Worker management commands
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Make sure a healthy worker is running without waiting for it
    Ensure,

    /// Show worker and queue status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Move failed entries back to pending
    Replay,

    /// Remove expired completed, failed and staging files
    Cleanup,

    /// Start a worker if none is healthy (spawned by enqueuers)
    #[command(hide = true)]
    Supervise,
}

#[derive(Subcommand)]
pub(crate) enum WorkerAction {
    /// Start a detached worker unless a healthy one is running
    Start,

    /// Run the worker in the foreground
    Run {
        /// Exit once pending is empty
        #[arg(long)]
        once: bool,
    },

    /// Stop the running worker
    Stop {
        /// Kill the worker if it does not stop in time
        #[arg(long)]
        force: bool,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "deferq",
            "enqueue",
            "-p",
            "3",
            "--tag",
            "bump",
            "--meta",
            "user=42",
            "UPDATE t SET x = 1",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                priority,
                tag,
                metadata,
                fallback_direct,
                payload,
            } => {
                assert_eq!(priority, 3);
                assert_eq!(tag, "bump");
                assert_eq!(metadata, vec![("user".to_string(), "42".to_string())]);
                assert!(!fallback_direct);
                assert_eq!(payload.as_deref(), Some("UPDATE t SET x = 1"));
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_parse_worker_run_once_with_config() {
        let cli = Cli::try_parse_from([
            "deferq",
            "worker",
            "run",
            "--once",
            "--config",
            "/etc/deferq.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/deferq.toml")));
        assert!(matches!(
            cli.command,
            Commands::Worker {
                action: WorkerAction::Run { once: true }
            }
        ));
    }

    #[test]
    fn test_bad_metadata_is_rejected() {
        assert!(Cli::try_parse_from(["deferq", "enqueue", "--meta", "novalue", "x"]).is_err());
        assert!(parse_key_value("=v").is_err());
        assert_eq!(parse_key_value("k=a=b").unwrap(), ("k".to_string(), "a=b".to_string()));
    }
}
