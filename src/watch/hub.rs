//! The shared observer service: registry plus wildcard throttle behind one lock.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::registry::{ConnId, ObserverTx, PushReport, Registry, Signal};
use crate::config::Limits;

/// Target that stands for the public device listing.
pub const WILDCARD: &str = "*";

struct HubState {
    registry: Registry,
    last_wildcard: Option<DateTime<Utc>>,
}

/// Owns every live observer subscription.
///
/// All mutations and the iteration done by `notify` run under a single
/// mutex; each operation only touches the observers of one target.
pub struct Hub {
    state: Mutex<HubState>,
    websocket_timeout: Duration,
    asterisk_min_time: Duration,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new(limits: &Limits) -> Self {
        Self {
            state: Mutex::new(HubState {
                registry: Registry::new(),
                last_wildcard: None,
            }),
            websocket_timeout: Duration::seconds(limits.websocket_timeout),
            asterisk_min_time: Duration::seconds(limits.asterisk_min_time),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Allocate an ID for a new observer connection.
    pub fn connection_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn subscribe(&self, target: &str, client_key: &str, conn_id: ConnId, tx: ObserverTx) {
        self.subscribe_at(target, client_key, conn_id, tx, Utc::now()).await
    }

    pub async fn subscribe_at(
        &self,
        target: &str,
        client_key: &str,
        conn_id: ConnId,
        tx: ObserverTx,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        state.registry.subscribe(target, client_key, conn_id, tx, now);
        tracing::debug!(channel = target, client_key, conn_id, "Observer subscribed");
    }

    pub async fn touch(&self, client_key: &str, conn_id: ConnId) -> bool {
        self.touch_at(client_key, conn_id, Utc::now()).await
    }

    pub async fn touch_at(&self, client_key: &str, conn_id: ConnId, now: DateTime<Utc>) -> bool {
        self.state.lock().await.registry.touch(client_key, conn_id, now)
    }

    /// Release the subscription held by a closing connection.
    pub async fn release(&self, client_key: &str, conn_id: ConnId) {
        if self.state.lock().await.registry.release(client_key, conn_id) {
            tracing::debug!(client_key, conn_id, "Observer released");
        }
    }

    /// Push `refresh` to every fresh observer of `target`.
    pub async fn notify(&self, target: &str) -> PushReport {
        self.notify_at(target, Utc::now()).await
    }

    /// Like [`Hub::notify`] with an explicit clock. Wildcard pushes closer
    /// than `ASTERISK_MIN_TIME` to the previous one are skipped silently.
    pub async fn notify_at(&self, target: &str, now: DateTime<Utc>) -> PushReport {
        let mut state = self.state.lock().await;
        if !state.registry.has_target(target) {
            return PushReport::default();
        }

        if target == WILDCARD {
            if let Some(last) = state.last_wildcard {
                if last + self.asterisk_min_time > now {
                    return PushReport::default();
                }
            }
            state.last_wildcard = Some(now);
        }

        let report = state
            .registry
            .push(target, Signal::Refresh, now, self.websocket_timeout);
        if report.purged > 0 {
            tracing::debug!(channel = target, purged = report.purged, "Purged stale observers");
        }
        report
    }

    #[cfg(test)]
    pub async fn has_target(&self, target: &str) -> bool {
        self.state.lock().await.registry.has_target(target)
    }

    #[cfg(test)]
    pub async fn observer_count(&self, target: &str) -> usize {
        self.state.lock().await.registry.observer_count(target)
    }
}
