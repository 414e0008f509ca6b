//! Backing store clients.
//!
//! A [`StoreClient`] executes a list of payloads as one transaction. The
//! worker never interprets payloads; it only distinguishes transient failures
//! (busy, locked, timed out) from permanent ones.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deferq_config::{DeferqConfig, StoreKind};
use rusqlite::{ErrorCode, TransactionBehavior};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, WorkerError};

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;

/// Executes batches against the backing store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Short name for logs.
    fn id(&self) -> &str;

    /// Apply every payload inside a single transaction. Either all of them
    /// take effect or none do, and an `Err` means none did.
    async fn execute_batch(&self, payloads: &[String]) -> Result<(), StoreError>;
}

/// Wrap payloads in one `BEGIN IMMEDIATE` / `COMMIT` script.
pub fn frame_batch(payloads: &[String]) -> String {
    let mut script = String::from("BEGIN IMMEDIATE;\n");
    for payload in payloads {
        let statement = payload.trim();
        script.push_str(statement);
        if !statement.ends_with(';') {
            script.push(';');
        }
        script.push('\n');
    }
    script.push_str("COMMIT;\n");
    script
}

/// SQLite virtual machine steps between deadline checks.
const PROGRESS_STEPS: i32 = 1000;

/// SQLite database opened in-process.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) a database file. `timeout` bounds the whole batch;
    /// the busy wait gets half of it.
    pub async fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, WorkerError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path.clone())
            .await
            .map_err(|e| WorkerError::StoreOpen(format!("{}: {}", path.display(), e)))?;

        let busy = timeout / 2;
        conn.call(move |conn| Ok(conn.busy_timeout(busy)?))
            .await
            .map_err(|e| WorkerError::StoreOpen(e.to_string()))?;

        debug!("SQLite store opened: {}", path.display());
        Ok(Self { conn, path, timeout })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn timed_out(&self) -> StoreError {
        StoreError::Transient(format!("timed out after {}ms", self.timeout.as_millis()))
    }
}

/// Why a batch transaction did not commit.
enum BatchAbort {
    TimedOut,
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for BatchAbort {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            BatchAbort::TimedOut
        } else {
            BatchAbort::Sqlite(err)
        }
    }
}

/// Run every payload in one immediate transaction, interrupting any
/// statement still running at `deadline`.
fn apply_batch(
    conn: &mut rusqlite::Connection,
    payloads: &[String],
    deadline: Instant,
) -> Result<(), BatchAbort> {
    conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));

    // Dropping an uncommitted transaction rolls it back
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for payload in payloads {
        tx.execute_batch(payload)?;
    }
    if Instant::now() >= deadline {
        return Err(BatchAbort::TimedOut);
    }
    tx.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl StoreClient for SqliteStore {
    fn id(&self) -> &str {
        "sqlite"
    }

    async fn execute_batch(&self, payloads: &[String]) -> Result<(), StoreError> {
        let payloads = payloads.to_vec();
        let deadline = Instant::now() + self.timeout;
        let outcome = self
            .conn
            .call(move |conn| {
                let outcome = apply_batch(conn, &payloads, deadline);
                conn.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);
                Ok(outcome)
            })
            .await;

        // The call is awaited to the end so a reported failure never commits
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(BatchAbort::TimedOut)) => Err(self.timed_out()),
            Ok(Err(BatchAbort::Sqlite(e))) => Err(classify_sqlite(e.into())),
            Err(e) => Err(classify_sqlite(e)),
        }
    }
}

/// External command that reads the framed batch on stdin, for example
/// `sqlite3 /var/lib/app.db`.
pub struct CommandStore {
    command: String,
    timeout: Duration,
}

impl CommandStore {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn run(&self, script: String) -> Result<std::process::Output, StoreError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| StoreError::Transient(format!("failed to spawn store command: {}", e)))?;
        let pid = child.id();

        let wait = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A command that exits without reading reports through its status
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    debug!("Store command closed stdin early: {}", e);
                }
            }
            child.wait_with_output().await
        };

        match timeout(self.timeout, wait).await {
            Ok(output) => output
                .map_err(|e| StoreError::Transient(format!("store command wait failed: {}", e))),
            Err(_) => {
                // kill_on_drop only reaches the shell, not what it started
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                Err(StoreError::Transient(format!(
                    "store command timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, "Store command group already gone: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[async_trait]
impl StoreClient for CommandStore {
    fn id(&self) -> &str {
        "command"
    }

    async fn execute_batch(&self, payloads: &[String]) -> Result<(), StoreError> {
        let output = self.run(frame_batch(payloads)).await?;

        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = format!("{}{}", stderr.trim(), stdout.trim());
        let code = output.status.code().unwrap_or(-1);
        let message = format!("exit code {}: {}", code, text);

        let lower = text.to_ascii_lowercase();
        if lower.contains("locked") || lower.contains("busy") {
            Err(StoreError::Transient(message))
        } else {
            Err(StoreError::Permanent(message))
        }
    }
}

/// Build the store client named by the configuration.
pub async fn open_store(config: &DeferqConfig) -> Result<Arc<dyn StoreClient>, WorkerError> {
    match config.store.kind {
        StoreKind::Sqlite => {
            let store = SqliteStore::open(config.store_database(), config.store_timeout()).await?;
            info!("Using SQLite store at {}", store.path().display());
            Ok(Arc::new(store))
        }
        StoreKind::Command => {
            let command = config
                .store
                .command
                .clone()
                .ok_or_else(|| WorkerError::StoreOpen("store.command is not set".to_string()))?;
            info!("Using command store: {}", command);
            Ok(Arc::new(CommandStore::new(command, config.store_timeout())))
        }
    }
}
