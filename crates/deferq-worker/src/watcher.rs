//! Change notifications for `pending/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use deferq_queue::task::ENTRY_EXTENSION;
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

/// Wake-ups buffered before further notifications are dropped. A full
/// buffer already guarantees the loop will wake and drain.
pub const WAKE_BUFFER: usize = 64;

/// Signals "an entry appeared under the watched directory".
pub trait ChangeWatcher: Send {
    /// Start watching; wake-ups arrive on the returned channel.
    fn start(&mut self) -> Result<mpsc::Receiver<()>, WorkerError>;

    /// Whether the watcher is still delivering events.
    fn is_alive(&self) -> bool;

    fn stop(&mut self);
}

/// [`ChangeWatcher`] backed by the platform's native notification API.
pub struct NotifyWatcher {
    dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    dead: Arc<AtomicBool>,
}

impl NotifyWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            watcher: None,
            dead: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// New or renamed-in `.json` files.
fn is_arrival(event: &Event) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any
    );
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
}

impl ChangeWatcher for NotifyWatcher {
    fn start(&mut self) -> Result<mpsc::Receiver<()>, WorkerError> {
        self.stop();
        let dead = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(WAKE_BUFFER);

        let handler_dead = Arc::clone(&dead);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_arrival(&event) => {
                    if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                        handler_dead.store(true, Ordering::SeqCst);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("File watcher error: {}", e);
                    handler_dead.store(true, Ordering::SeqCst);
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| WorkerError::Watcher(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                WorkerError::Watcher(format!("Failed to watch {}: {}", self.dir.display(), e))
            })?;

        info!("Watching {}", self.dir.display());
        self.watcher = Some(watcher);
        self.dead = dead;
        Ok(rx)
    }

    fn is_alive(&self) -> bool {
        self.watcher.is_some() && !self.dead.load(Ordering::SeqCst) && self.dir.is_dir()
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            debug!("Stopped watching {}", self.dir.display());
        }
    }
}
