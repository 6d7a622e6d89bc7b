//! Scheduler module for periodic background work.

mod down_alerts;

pub use down_alerts::*;

use crate::config::Limits;
use crate::db::Store;
use crate::mailer::Mailer;

use std::sync::Arc;

/// Owns the periodic managers of the service.
pub struct Scheduler {
    down_alerts: Arc<DownAlertManager>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, mailer: Mailer, limits: Limits) -> Self {
        Self {
            down_alerts: Arc::new(DownAlertManager::new(store, mailer, limits)),
        }
    }

    /// Start every manager.
    pub fn start(&self) {
        tracing::info!("Starting scheduler");
        self.down_alerts.start();
    }

    /// Stop every manager.
    pub async fn stop(&self) {
        self.down_alerts.stop().await;
    }
}
