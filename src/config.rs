use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CaptureError;

/// Key the producer writes serialized records to.
pub const WATCHED_KEY: &str = "adminData";
/// Key the captured history is persisted under.
pub const HISTORY_KEY: &str = "adminConsultas";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_CAPACITY: usize = 100;

/// Runtime settings for the capture poller and its monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub watched_key: String,
    pub history_key: String,
    pub poll_interval_ms: u64,
    pub capacity: usize,
    pub identifier_field: String,
    /// Identifier value a producer writes when nothing was looked up yet.
    pub unset_identifier: String,
    pub name_field: String,
    pub phone_field: String,
    /// Phone value a producer writes while the lookup is still pending.
    pub phone_placeholder: String,
    /// Substring a location path must contain for the monitor to start.
    pub activation_marker: String,
    pub quota_bytes: Option<usize>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watched_key: WATCHED_KEY.to_string(),
            history_key: HISTORY_KEY.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            capacity: DEFAULT_CAPACITY,
            identifier_field: "cpf".to_string(),
            unset_identifier: "undefined".to_string(),
            name_field: "nome".to_string(),
            phone_field: "telefone".to_string(),
            phone_placeholder: "Aguardando...".to_string(),
            activation_marker: "admin".to_string(),
            quota_bytes: None,
        }
    }
}

impl MonitorConfig {
    /// Load a config file. Missing fields fall back to their defaults.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::Configuration(format!("{}: {}", path.display(), e)))?;
        let config: MonitorConfig = serde_json::from_str(&data)
            .map_err(|e| CaptureError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.capacity == 0 {
            return Err(CaptureError::Configuration(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CaptureError::Configuration(
                "pollIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.watched_key == self.history_key {
            return Err(CaptureError::Configuration(format!(
                "watchedKey and historyKey must differ (both are '{}')",
                self.watched_key
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether a page at `location` should run the monitor.
    pub fn should_activate(&self, location: &str) -> bool {
        location.contains(&self.activation_marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.watched_key, "adminData");
        assert_eq!(config.history_key, "adminConsultas");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("monitor.json");
        std::fs::write(&path, r#"{"capacity": 5, "quotaBytes": 4096}"#).unwrap();

        let config = MonitorConfig::from_file(&path).unwrap();
        assert_eq!(config.capacity, 5);
        assert_eq!(config.quota_bytes, Some(4096));
        assert_eq!(config.watched_key, WATCHED_KEY);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("monitor.json");
        std::fs::write(&path, r#"{"capacity": 0}"#).unwrap();
        assert!(matches!(
            MonitorConfig::from_file(&path),
            Err(CaptureError::Configuration(_))
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(MonitorConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_activation() {
        let config = MonitorConfig::default();
        assert!(config.should_activate("/admin.html"));
        assert!(config.should_activate("/panel/admin/"));
        assert!(!config.should_activate("/index.html"));
    }
}
