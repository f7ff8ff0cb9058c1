use chrono::{DateTime, Local, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::MonitorConfig;
use crate::export::{self, display_value, ExportFormat};
use crate::history::History;
use crate::record::{is_truthy, Record, Stats};
use crate::storage::{Storage, StorageSubscription};

/// Called with every newly captured record.
pub type NotifyHook = Arc<dyn Fn(&Record) + Send + Sync>;

/// Turns values written to the watched key into records and keeps the
/// bounded, persisted history of them.
///
/// Nothing here returns an error: bad input and failed saves are logged and
/// the poller carries on with the next value.
pub struct CapturePoller {
    storage: Storage,
    config: MonitorConfig,
    history: History,
    last_snapshot: Option<String>,
    last_id: i64,
    notify_hook: Option<NotifyHook>,
}

impl CapturePoller {
    /// Load the persisted history and get ready to capture. A history that
    /// cannot be read is logged and replaced by an empty one.
    pub fn new(storage: Storage, config: MonitorConfig) -> Self {
        info!("🔧 Capture poller initialized");
        let history = Self::load_history(&storage, &config);
        let last_id = history.iter().map(|r| r.id).max().unwrap_or(0);

        Self {
            storage,
            config,
            history,
            last_snapshot: None,
            last_id,
            notify_hook: None,
        }
    }

    fn load_history(storage: &Storage, config: &MonitorConfig) -> History {
        match Self::read_history(storage, config) {
            Ok(records) => {
                info!("📊 {} records loaded", records.len());
                History::from_records(records, config.capacity)
            }
            Err(e) => {
                error!("❌ Failed to load records: {}", e);
                History::with_capacity(config.capacity)
            }
        }
    }

    fn read_history(storage: &Storage, config: &MonitorConfig) -> crate::Result<Vec<Record>> {
        match storage.get_item(&config.history_key)? {
            Some(saved) if !saved.is_empty() => Ok(serde_json::from_str(&saved)?),
            _ => Ok(Vec::new()),
        }
    }

    pub fn set_notify_hook<F>(&mut self, hook: F)
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.notify_hook = Some(Arc::new(hook));
    }

    pub fn clear_notify_hook(&mut self) {
        self.notify_hook = None;
    }

    /// Change notifications for this poller's storage context.
    pub fn subscribe(&self) -> StorageSubscription {
        self.storage.subscribe()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn last_snapshot(&self) -> Option<&str> {
        self.last_snapshot.as_deref()
    }

    /// Re-read the watched key and process it if it differs from the last
    /// value seen.
    pub fn check_for_updates(&mut self) -> Option<Record> {
        let current = match self.storage.get_item(&self.config.watched_key) {
            Ok(current) => current,
            Err(e) => {
                error!("❌ Failed to read {}: {}", self.config.watched_key, e);
                return None;
            }
        };
        if current == self.last_snapshot {
            return None;
        }
        self.handle_new_data(current.as_deref())
    }

    /// Process one raw value from the watched key.
    ///
    /// Returns the captured record when a full cycle completed: record added,
    /// history saved, hook notified. Empty or `{}` input, unparsable JSON and
    /// data without a usable identifier are skipped. The snapshot is updated
    /// as soon as the value parses, so a repeat of the same string is ignored
    /// by [`CapturePoller::check_for_updates`].
    pub fn handle_new_data(&mut self, raw: Option<&str>) -> Option<Record> {
        let raw = match raw {
            Some(raw) if !raw.is_empty() && raw != "{}" => raw,
            _ => return None,
        };

        let data: Value = match serde_json::from_str(raw) {
            Ok(data) => data,
            Err(e) => {
                error!("❌ Failed to process new data: {}", e);
                return None;
            }
        };
        self.last_snapshot = Some(raw.to_string());

        let Value::Object(fields) = data else {
            debug!("Ignoring non-object value on {}", self.config.watched_key);
            return None;
        };
        if !self.has_identifier(&fields) {
            debug!("Ignoring value without a usable {}", self.config.identifier_field);
            return None;
        }

        let now = Utc::now();
        let record = Record::capture(fields, self.next_id(now), now);

        if let Some(evicted) = self.history.push_front(record.clone()) {
            debug!("History full, dropped record {}", evicted.id);
        }

        if let Err(e) = self.save_history() {
            error!("❌ Failed to save records: {}", e);
            return None;
        }

        info!(
            "🎯 New record captured: {}={} {}={} at {}",
            self.config.identifier_field,
            display_value(record.get(&self.config.identifier_field)),
            self.config.name_field,
            display_value(record.get(&self.config.name_field)),
            Local::now().format("%d/%m/%Y %H:%M:%S"),
        );

        if let Some(hook) = &self.notify_hook {
            hook(&record);
        }

        Some(record)
    }

    fn has_identifier(&self, fields: &Map<String, Value>) -> bool {
        match fields.get(&self.config.identifier_field) {
            Some(Value::String(s)) if *s == self.config.unset_identifier => false,
            Some(value) => is_truthy(value),
            None => false,
        }
    }

    // Millisecond timestamp, bumped past the previous id when the clock has
    // not moved on.
    fn next_id(&mut self, now: DateTime<Utc>) -> i64 {
        let id = now.timestamp_millis().max(self.last_id + 1);
        self.last_id = id;
        id
    }

    fn save_history(&self) -> crate::Result<()> {
        let data = serde_json::to_string(&self.history)?;
        self.storage.set_item(&self.config.history_key, &data)
    }

    pub fn get_stats(&self) -> Stats {
        let with_telefone = self
            .history
            .iter()
            .filter(|record| match record.get(&self.config.phone_field) {
                Some(Value::String(s)) if *s == self.config.phone_placeholder => false,
                Some(value) => is_truthy(value),
                None => false,
            })
            .count();

        Stats {
            total_consultas: self.history.len(),
            with_telefone,
            last_consulta: self.history.first().cloned(),
        }
    }

    /// Render the history. A serialization failure is logged and yields an
    /// empty string.
    pub fn export_data(&self, format: ExportFormat) -> String {
        match format {
            ExportFormat::Json => export::to_json(&self.history).unwrap_or_else(|e| {
                error!("❌ Failed to export records: {}", e);
                String::new()
            }),
            ExportFormat::Csv => export::to_csv(&self.history),
        }
    }
}
