//! Bidirectional index between notification targets and observers.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Identifies one observer connection for its whole lifetime.
pub type ConnId = u64;

/// Messages pushed to an observer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Acknowledges any inbound message.
    Ack,
    /// State behind the subscribed target changed.
    Refresh,
}

impl Signal {
    /// Wire form of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Ack => ".",
            Signal::Refresh => "refresh",
        }
    }
}

/// Sender half used to push signals to a connection.
pub type ObserverTx = mpsc::UnboundedSender<Signal>;

struct Observer {
    conn_id: ConnId,
    tx: ObserverTx,
    last_activity: DateTime<Utc>,
}

/// Outcome of pushing a signal to every observer of a target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub delivered: usize,
    pub purged: usize,
}

/// Target -> observers, plus client key -> target.
///
/// Each client key is subscribed to at most one target. Empty target sets
/// are removed eagerly.
#[derive(Default)]
pub struct Registry {
    targets: HashMap<String, HashMap<String, Observer>>,
    keys: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `client_key` to `target`, dropping any previous subscription
    /// of that key first.
    pub fn subscribe(
        &mut self,
        target: &str,
        client_key: &str,
        conn_id: ConnId,
        tx: ObserverTx,
        now: DateTime<Utc>,
    ) {
        self.remove_key(client_key);

        self.targets.entry(target.to_string()).or_default().insert(
            client_key.to_string(),
            Observer {
                conn_id,
                tx,
                last_activity: now,
            },
        );
        self.keys.insert(client_key.to_string(), target.to_string());
    }

    /// Refresh the activity timestamp of `client_key`, provided the key is
    /// still held by `conn_id`. Returns whether an entry was refreshed.
    pub fn touch(&mut self, client_key: &str, conn_id: ConnId, now: DateTime<Utc>) -> bool {
        let Some(target) = self.keys.get(client_key) else {
            return false;
        };
        match self
            .targets
            .get_mut(target)
            .and_then(|observers| observers.get_mut(client_key))
        {
            Some(observer) if observer.conn_id == conn_id => {
                observer.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Drop the subscription of `client_key` if `conn_id` still holds it.
    /// A key taken over by a newer connection is left alone.
    pub fn release(&mut self, client_key: &str, conn_id: ConnId) -> bool {
        let owned = self
            .keys
            .get(client_key)
            .and_then(|target| self.targets.get(target))
            .and_then(|observers| observers.get(client_key))
            .is_some_and(|observer| observer.conn_id == conn_id);

        owned && self.remove_key(client_key)
    }

    /// Push `signal` to every fresh observer of `target`. Observers silent for
    /// longer than `timeout`, or whose connection is gone, are purged.
    pub fn push(
        &mut self,
        target: &str,
        signal: Signal,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> PushReport {
        let mut report = PushReport::default();
        let Some(observers) = self.targets.get_mut(target) else {
            return report;
        };

        let mut stale = Vec::new();
        for (key, observer) in observers.iter() {
            if now - observer.last_activity > timeout {
                stale.push(key.clone());
            } else if observer.tx.send(signal).is_err() {
                stale.push(key.clone());
            } else {
                report.delivered += 1;
            }
        }

        for key in &stale {
            observers.remove(key);
            self.keys.remove(key);
        }
        if observers.is_empty() {
            self.targets.remove(target);
        }

        report.purged = stale.len();
        report
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    #[cfg(test)]
    /// Target the key is currently subscribed to.
    pub fn target_of(&self, client_key: &str) -> Option<&str> {
        self.keys.get(client_key).map(String::as_str)
    }

    #[cfg(test)]
    pub fn observer_count(&self, target: &str) -> usize {
        self.targets.get(target).map_or(0, HashMap::len)
    }

    #[cfg(test)]
    /// Number of subscribed client keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn remove_key(&mut self, client_key: &str) -> bool {
        let Some(target) = self.keys.remove(client_key) else {
            return false;
        };
        if let Some(observers) = self.targets.get_mut(&target) {
            observers.remove(client_key);
            if observers.is_empty() {
                self.targets.remove(&target);
            }
        }
        true
    }
}
