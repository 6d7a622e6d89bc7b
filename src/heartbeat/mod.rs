//! Heartbeat ingestion.
//!
//! A heartbeat is identified by the device's update token. [`HeartbeatProcessor`]
//! resolves the token, serializes work per device, runs the pure rules from
//! [`rules`] and persists the outcome before any observer is told.

mod locks;
pub mod rules;

pub use locks::DeviceLocks;
pub use rules::Decision;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::Limits;
use crate::db::{DbError, Store, TokenKind};
use crate::mailer::Mailer;
use crate::watch::Notifier;

/// What the caller tells the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No device holds this update token.
    BadToken,
    /// Retry after this many seconds. Nothing was changed.
    TooSoon { retry_after: i64 },
    Accepted {
        /// Gap since the previous heartbeat; `None` on the first one.
        reported_gap: Option<i64>,
        /// Interval the device should use for its next heartbeat.
        next_interval: i64,
    },
}

pub struct HeartbeatProcessor {
    store: Arc<Store>,
    limits: Limits,
    locks: Arc<DeviceLocks>,
    notifier: Notifier,
    mailer: Mailer,
}

impl HeartbeatProcessor {
    pub fn new(
        store: Arc<Store>,
        limits: Limits,
        locks: Arc<DeviceLocks>,
        notifier: Notifier,
        mailer: Mailer,
    ) -> Self {
        Self {
            store,
            limits,
            locks,
            notifier,
            mailer,
        }
    }

    /// Process one heartbeat received at `now` from `source_ip`.
    pub async fn process(
        &self,
        token: &str,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, DbError> {
        let Some(found) = self.store.find_by_token(TokenKind::Update, token)? else {
            return Ok(HeartbeatOutcome::BadToken);
        };

        let _guard = self.locks.lock(found.id).await;

        // The token may have been rotated while we waited.
        let mut device = match self.store.get_device(found.id)? {
            Some(device) if device.update_token.as_deref() == Some(token) => device,
            _ => return Ok(HeartbeatOutcome::BadToken),
        };

        match rules::apply(&mut device, source_ip, now, &self.limits) {
            Decision::TooSoon { retry_after } => {
                tracing::debug!(device_id = device.id, retry_after, "Heartbeat too soon");
                Ok(HeartbeatOutcome::TooSoon { retry_after })
            }
            Decision::Accepted {
                event,
                gap,
                came_back,
            } => {
                self.store.record_heartbeat(&device, event.as_ref())?;

                if came_back {
                    tracing::info!(
                        device_id = device.id,
                        downtime = gap.unwrap_or_default(),
                        "Device back online"
                    );
                    if device.notify_up && device.email_confirmed {
                        self.mailer.send_up(&device);
                    }
                }

                self.notifier.notify_device(&device);

                Ok(HeartbeatOutcome::Accepted {
                    reported_gap: gap,
                    next_interval: device.interval,
                })
            }
        }
    }
}
