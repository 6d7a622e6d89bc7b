//! Per-device mutual exclusion for heartbeat processing.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Serializes heartbeats of the same device while letting different
/// devices proceed in parallel.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `device_id`.
    pub async fn lock(&self, device_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > PRUNE_THRESHOLD {
                // Only the map holds a reference to an idle lock.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(device_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_device_is_exclusive() {
        let locks = Arc::new(DeviceLocks::new());
        let guard = locks.lock(1).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_devices_do_not_block() {
        let locks = DeviceLocks::new();
        let _first = locks.lock(1).await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.lock(2)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let locks = DeviceLocks::new();
        for id in 0..=PRUNE_THRESHOLD as i64 {
            drop(locks.lock(id).await);
        }
        assert_eq!(locks.len().await, PRUNE_THRESHOLD + 1);

        let _held = locks.lock(-1).await;
        assert_eq!(locks.len().await, 1);
    }
}
