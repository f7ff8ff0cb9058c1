//! Drives a [`CapturePoller`] from two independent triggers.
//!
//! Storage-change events for the watched key and a fixed-period tick are
//! forwarded into one channel and handled by a single task, so the poller is
//! never entered concurrently. Repeated triggers for the same value are
//! absorbed by the poller's snapshot check.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::poller::CapturePoller;
use crate::storage_watcher::StorageWatcher;

const TRIGGER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The watched key changed in another context; carries the new value.
    Changed(Option<String>),
    /// Periodic re-read of the watched key.
    Tick,
}

/// Tasks started by [`spawn`].
pub struct MonitorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("🛑 Monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

/// Start monitoring. When the poller's storage is backed by a file, writes
/// made to it by other processes are followed as well.
pub async fn spawn(poller: Arc<Mutex<CapturePoller>>) -> MonitorHandle {
    let (mut subscription, watched_key, period, storage) = {
        let guard = poller.lock().await;
        (
            guard.subscribe(),
            guard.config().watched_key.clone(),
            guard.config().poll_interval(),
            guard.storage().clone(),
        )
    };

    let (tx, mut rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
    let mut tasks = Vec::new();

    let events_tx = tx.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if event.key != watched_key {
                continue;
            }
            if events_tx.send(Trigger::Changed(event.new_value)).await.is_err() {
                break;
            }
        }
    }));

    tasks.push(tokio::spawn(tick(tx, period)));

    if storage.persistence_path().is_some() {
        match StorageWatcher::new(storage) {
            Ok(watcher) => tasks.push(tokio::spawn(async move {
                if let Err(e) = watcher.start_watching().await {
                    warn!("⚠️ File watching unavailable, relying on polling: {}", e);
                }
            })),
            Err(e) => warn!("⚠️ File watching unavailable, relying on polling: {}", e),
        }
    }

    tasks.push(tokio::spawn(async move {
        while let Some(trigger) = rx.recv().await {
            debug!("Trigger: {:?}", trigger);
            let mut poller = poller.lock().await;
            match trigger {
                Trigger::Changed(value) => {
                    poller.handle_new_data(value.as_deref());
                }
                Trigger::Tick => {
                    poller.check_for_updates();
                }
            }
        }
    }));

    info!("👀 Monitoring started (poll every {:?})", period);
    MonitorHandle { tasks }
}

async fn tick(tx: mpsc::Sender<Trigger>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if tx.send(Trigger::Tick).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, WATCHED_KEY};
    use crate::storage::Storage;

    async fn wait_for_len(poller: &Arc<Mutex<CapturePoller>>, len: usize) -> bool {
        for _ in 0..100 {
            if poller.lock().await.history().len() == len {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_cross_context_write_captured_by_event() {
        let storage = Storage::in_memory();
        let producer = storage.new_context();
        // Long interval so only the event path can fire.
        let config = MonitorConfig {
            poll_interval_ms: 60_000,
            ..MonitorConfig::default()
        };
        let poller = Arc::new(Mutex::new(CapturePoller::new(storage, config)));
        let handle = spawn(poller.clone()).await;

        producer
            .set_item(WATCHED_KEY, r#"{"cpf":"111","nome":"Bia"}"#)
            .unwrap();
        assert!(wait_for_len(&poller, 1).await);

        producer.set_item("unrelated", r#"{"cpf":"999"}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller.lock().await.history().len(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_same_context_write_captured_by_interval() {
        let storage = Storage::in_memory();
        let config = MonitorConfig {
            poll_interval_ms: 20,
            ..MonitorConfig::default()
        };
        let poller = Arc::new(Mutex::new(CapturePoller::new(storage.clone(), config)));
        let handle = spawn(poller.clone()).await;

        // Same context: no storage event is delivered, only polling sees it.
        storage
            .set_item(WATCHED_KEY, r#"{"cpf":"222","nome":"Caio"}"#)
            .unwrap();
        assert!(wait_for_len(&poller, 1).await);

        // Further ticks over the unchanged value add nothing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(poller.lock().await.history().len(), 1);

        assert!(handle.is_running());
        handle.shutdown();
    }
}
