//! Periodic down-alert scan.

use crate::config::Limits;
use crate::db::Store;
use crate::mailer::Mailer;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Mails owners whose devices went silent for longer than their notify interval.
pub struct DownAlertManager {
    store: Arc<Store>,
    mailer: Mailer,
    limits: Limits,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl DownAlertManager {
    pub fn new(store: Arc<Store>, mailer: Mailer, limits: Limits) -> Self {
        Self {
            store,
            mailer,
            limits,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the scan loop. Each tick runs its scan on a separate task so a
    /// slow scan never delays the next one.
    pub fn start(&self) {
        let store = self.store.clone();
        let mailer = self.mailer.clone();
        let limits = self.limits.clone();
        let stop = self.stop.clone();
        let period = Duration::from_secs(self.limits.min_interval.max(1) as u64);

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let mailer = mailer.clone();
                        let limits = limits.clone();
                        tokio::spawn(async move {
                            scan(&store, &mailer, &limits, Utc::now());
                        });
                    }
                }
            }
        });
    }

    /// Stop the scan loop.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// One pass over the candidates. Returns the number of alerts sent.
///
/// A failure on one device is logged and the scan moves on.
pub fn scan(store: &Store, mailer: &Mailer, limits: &Limits, now: DateTime<Utc>) -> usize {
    let candidates = match store.due_for_down_alert(now, limits) {
        Ok(devices) => devices,
        Err(e) => {
            tracing::error!("DownAlertManager: Failed to load candidates: {}", e);
            return 0;
        }
    };

    let mut sent = 0;
    for device in candidates {
        let Some(last_seen) = device.last_seen else {
            continue;
        };
        if last_seen >= now - ChronoDuration::seconds(device.notify_interval) {
            continue;
        }

        match store.mark_notified_down(device.id, last_seen) {
            Ok(true) => {
                mailer.send_down(&device);
                sent += 1;
            }
            Ok(false) => {
                tracing::debug!(device_id = device.id, "Device reported during scan");
            }
            Err(e) => {
                tracing::error!(device_id = device.id, "DownAlertManager: Failed to latch alert: {}", e);
            }
        }
    }

    if sent > 0 {
        tracing::info!(sent, "Down alerts sent");
    }
    sent
}
