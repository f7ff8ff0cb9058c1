use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CaptureError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Who performed a write that produced a [`StorageEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOrigin {
    /// A handle in this process, identified by its context id.
    Context(String),
    /// Another process rewrote the backing file.
    External,
}

/// Change notification for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: EventOrigin,
}

#[derive(Default)]
struct StorageInner {
    items: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl StorageInner {
    fn used_bytes(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

struct Shared {
    inner: RwLock<StorageInner>,
    // Held across a memory change and the file write (or file read and
    // swap on reload) so the two never interleave.
    file_lock: Mutex<()>,
    persistence_path: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
}

/// String key/value store shared between execution contexts.
///
/// Every `Storage` value is one context. Clones share the context id, while
/// [`Storage::new_context`] hands out a sibling with its own id. Change events
/// are delivered to every context except the one that made the change, so a
/// context never hears about its own writes.
///
/// A store opened with [`Storage::with_path`] keeps its items in a JSON object
/// file, rewritten after each mutation.
#[derive(Clone)]
pub struct Storage {
    shared: Arc<Shared>,
    context_id: String,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self::from_parts(StorageInner::default(), None)
    }

    // If the file exists it is loaded into memory. A file that does not parse
    // is logged and replaced on the next write.
    pub fn with_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let pb = path.as_ref().to_path_buf();
        let mut inner = StorageInner::default();

        if pb.exists() {
            let data = fs::read_to_string(&pb)
                .map_err(|e| CaptureError::FileSystem(format!("{}: {}", pb.display(), e)))?;
            match serde_json::from_str::<BTreeMap<String, String>>(&data) {
                Ok(items) => inner.items = items,
                Err(e) => warn!("⚠️ Ignoring unreadable storage file {}: {}", pb.display(), e),
            }
        }

        Ok(Self::from_parts(inner, Some(pb)))
    }

    fn from_parts(inner: StorageInner, persistence_path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(inner),
                file_lock: Mutex::new(()),
                persistence_path,
                events,
            }),
            context_id: Uuid::new_v4().to_string(),
        }
    }

    /// Limit the total size of keys plus values, in bytes.
    pub fn with_quota(self, quota: usize) -> Self {
        if let Ok(mut guard) = self.shared.inner.write() {
            guard.quota = Some(quota);
        }
        self
    }

    /// Another handle on the same data with a fresh context id.
    pub fn new_context(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            context_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.shared.persistence_path.as_deref()
    }

    pub fn default_path() -> PathBuf {
        Self::data_dir().join("storage.json")
    }

    fn lock_file(&self) -> crate::Result<MutexGuard<'_, ()>> {
        self.shared
            .file_lock
            .lock()
            .map_err(|e| CaptureError::Storage(e.to_string()))
    }

    fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&StorageInner) -> R,
    {
        let guard = self
            .shared
            .inner
            .read()
            .map_err(|e| CaptureError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut StorageInner) -> R,
    {
        let mut guard = self
            .shared
            .inner
            .write()
            .map_err(|e| CaptureError::Storage(e.to_string()))?;
        Ok(f(&mut guard))
    }

    pub fn get_item(&self, key: &str) -> crate::Result<Option<String>> {
        self.with_read(|guard| guard.items.get(key).cloned())
    }

    pub fn keys(&self) -> crate::Result<Vec<String>> {
        self.with_read(|guard| guard.items.keys().cloned().collect())
    }

    pub fn len(&self) -> crate::Result<usize> {
        self.with_read(|guard| guard.items.len())
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn used_bytes(&self) -> crate::Result<usize> {
        self.with_read(|guard| guard.used_bytes())
    }

    /// Store `value` under `key`. Fails without changing anything when the
    /// write would push the store over its quota. Writing the value a key
    /// already holds is a no-op and fires no event.
    pub fn set_item(&self, key: &str, value: &str) -> crate::Result<()> {
        let file_guard = self.lock_file()?;
        let outcome = self.with_write(|guard| {
            let old = guard.items.get(key).cloned();
            if old.as_deref() == Some(value) {
                return Ok(None);
            }
            if let Some(quota) = guard.quota {
                let freed = old.as_ref().map(|v| key.len() + v.len()).unwrap_or(0);
                let required = guard.used_bytes() - freed + key.len() + value.len();
                if required > quota {
                    return Err(CaptureError::QuotaExceeded {
                        key: key.to_string(),
                        required,
                        quota,
                    });
                }
            }
            guard.items.insert(key.to_string(), value.to_string());
            Ok(Some((old, guard.items.clone())))
        })??;

        if let Some((old_value, snapshot)) = outcome {
            self.persist(&snapshot)?;
            drop(file_guard);
            self.emit(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
                origin: EventOrigin::Context(self.context_id.clone()),
            });
        }
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> crate::Result<()> {
        let file_guard = self.lock_file()?;
        let outcome = self.with_write(|guard| {
            guard
                .items
                .remove(key)
                .map(|old| (old, guard.items.clone()))
        })?;

        if let Some((old_value, snapshot)) = outcome {
            self.persist(&snapshot)?;
            drop(file_guard);
            self.emit(StorageEvent {
                key: key.to_string(),
                old_value: Some(old_value),
                new_value: None,
                origin: EventOrigin::Context(self.context_id.clone()),
            });
        }
        Ok(())
    }

    /// Events caused by other contexts or by other processes.
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            receiver: self.shared.events.subscribe(),
            context_id: self.context_id.clone(),
        }
    }

    /// Re-read the backing file and emit an external event for every key
    /// whose value differs from memory. Returns the number of changed keys.
    pub fn reload(&self) -> crate::Result<usize> {
        let Some(path) = &self.shared.persistence_path else {
            return Ok(0);
        };
        let file_guard = self.lock_file()?;
        if !path.exists() {
            return Ok(0);
        }
        let data = fs::read_to_string(path)
            .map_err(|e| CaptureError::FileSystem(format!("{}: {}", path.display(), e)))?;
        // A writer may be midway through replacing the file; the next
        // notification will bring the finished content.
        let items: BTreeMap<String, String> = match serde_json::from_str(&data) {
            Ok(items) => items,
            Err(e) => {
                debug!("Skipping reload of {}: {}", path.display(), e);
                return Ok(0);
            }
        };

        let changes = self.with_write(|guard| {
            let mut changes = Vec::new();
            for (key, value) in &items {
                let old = guard.items.get(key);
                if old != Some(value) {
                    changes.push((key.clone(), old.cloned(), Some(value.clone())));
                }
            }
            for (key, old) in &guard.items {
                if !items.contains_key(key) {
                    changes.push((key.clone(), Some(old.clone()), None));
                }
            }
            guard.items = items;
            changes
        })?;
        drop(file_guard);

        let count = changes.len();
        for (key, old_value, new_value) in changes {
            self.emit(StorageEvent {
                key,
                old_value,
                new_value,
                origin: EventOrigin::External,
            });
        }
        Ok(count)
    }

    pub fn flush(&self) -> crate::Result<()> {
        let _file_guard = self.lock_file()?;
        let snapshot = self.with_read(|guard| guard.items.clone())?;
        self.persist(&snapshot)
    }

    fn emit(&self, event: StorageEvent) {
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> crate::Result<()> {
        let Some(path) = &self.shared.persistence_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| CaptureError::FileSystem(e.to_string()))?;
            }
        }
        let data = serde_json::to_string_pretty(items)?;
        Self::atomic_write(path, data.as_bytes())
    }

    // Writes to a temporary file in the same directory and then renames into place.
    fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
        use rand::{thread_rng, Rng};

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => return Err(CaptureError::FileSystem("Invalid path".to_string())),
        };
        let suffix: u64 = thread_rng().gen();
        let tmp = parent
            .join(".tmp_capture")
            .with_extension(format!("{}.tmp", suffix));

        fs::write(&tmp, bytes).map_err(|e| CaptureError::FileSystem(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| CaptureError::FileSystem(e.to_string()))?;
        Ok(())
    }

    fn data_dir() -> PathBuf {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("capture-monitor")
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("Library/Application Support/capture-monitor")
        } else {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share/capture-monitor")
        }
    }
}

/// Receiver half of [`Storage::subscribe`].
pub struct StorageSubscription {
    receiver: broadcast::Receiver<StorageEvent>,
    context_id: String,
}

impl StorageSubscription {
    fn is_own(&self, event: &StorageEvent) -> bool {
        matches!(&event.origin, EventOrigin::Context(id) if *id == self.context_id)
    }

    /// Next event not caused by the subscribing context. `None` once every
    /// handle on the store has been dropped.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.is_own(&event) {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("⚠️ Storage subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`StorageSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.is_own(&event) {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
