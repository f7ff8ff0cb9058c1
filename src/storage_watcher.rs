use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, warn};

use crate::error::CaptureError;
use crate::storage::Storage;

const WATCH_CHANNEL_CAPACITY: usize = 100;
// How often the notification thread checks whether its consumer is gone.
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Follows writes other processes make to a file-backed [`Storage`].
///
/// The parent directory is watched rather than the file itself, because
/// writers replace the file by renaming a temporary one over it. Every
/// create or modify of the backing file triggers [`Storage::reload`], which
/// turns the differences into storage events.
pub struct StorageWatcher {
    storage: Storage,
    directory: PathBuf,
    file_name: OsString,
}

impl StorageWatcher {
    pub fn new(storage: Storage) -> crate::Result<Self> {
        let path = storage.persistence_path().ok_or_else(|| {
            CaptureError::Configuration("storage has no backing file to watch".to_string())
        })?;
        let file_name = path
            .file_name()
            .ok_or_else(|| CaptureError::FileSystem(format!("Invalid path: {}", path.display())))?
            .to_os_string();
        let directory = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            storage,
            directory,
            file_name,
        })
    }

    pub fn is_relevant(&self, event: &notify::Event) -> bool {
        let kind_matches = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
        kind_matches && event.paths.iter().any(|p| self.is_backing_file(p))
    }

    fn is_backing_file(&self, path: &Path) -> bool {
        path.file_name() == Some(self.file_name.as_os_str())
    }

    /// Runs until the notification thread goes away.
    pub async fn start_watching(self) -> crate::Result<()> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory)
                .map_err(|e| CaptureError::FileSystem(e.to_string()))?;
        }

        let (tx, mut rx) = tokio_mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher = recommended_watcher(notify_tx)?;
        watcher.watch(&self.directory, RecursiveMode::NonRecursive)?;
        debug!("👀 Watching {} for storage changes", self.directory.display());

        std::thread::spawn(move || {
            // The OS watch is released when this thread returns.
            let _watcher = watcher;
            forward_events(notify_rx, tx);
        });

        while let Some(event) = rx.recv().await {
            self.process_event(&event);
        }

        Ok(())
    }

    fn process_event(&self, event: &notify::Event) {
        if !self.is_relevant(event) {
            return;
        }
        match self.storage.reload() {
            Ok(0) => {}
            Ok(changed) => debug!("🔄 Storage reloaded, {} keys changed", changed),
            Err(e) => warn!("⚠️ Failed to reload storage: {}", e),
        }
    }
}

/// Pass notifications on until the receiving task goes away. Wakes up
/// periodically so an aborted consumer ends the thread without waiting for
/// another file system event.
fn forward_events(
    notify_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    tx: tokio_mpsc::Sender<notify::Event>,
) {
    loop {
        match notify_rx.recv_timeout(CLOSE_CHECK_INTERVAL) {
            Ok(Ok(event)) => {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!("⚠️ Storage watcher error: {}", e);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                error!("❌ Storage watcher channel disconnected");
                break;
            }
        }
    }
    debug!("Storage watcher thread stopped");
}
