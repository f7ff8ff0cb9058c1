pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod monitor;
pub mod poller;
pub mod record;
pub mod storage;
pub mod storage_watcher;

pub use config::MonitorConfig;
pub use error::CaptureError;
pub use export::ExportFormat;
pub use history::History;
pub use monitor::{MonitorHandle, Trigger};
pub use poller::{CapturePoller, NotifyHook};
pub use record::{Record, Stats};
pub use storage::{EventOrigin, Storage, StorageEvent, StorageSubscription};
pub use storage_watcher::StorageWatcher;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, CaptureError>;
