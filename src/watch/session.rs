//! State of one observer connection, independent of the socket type.

use std::sync::Arc;

use super::hub::Hub;
use super::protocol::{parse, Inbound};
use super::registry::{ConnId, ObserverTx, Signal};

/// What the socket loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Tracks the client key a connection currently holds.
pub struct Session {
    hub: Arc<Hub>,
    conn_id: ConnId,
    tx: ObserverTx,
    client_key: Option<String>,
}

impl Session {
    pub fn new(hub: Arc<Hub>, tx: ObserverTx) -> Self {
        let conn_id = hub.connection_id();
        Self {
            hub,
            conn_id,
            tx,
            client_key: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Handle one inbound text frame. Every accepted message is acknowledged
    /// before the subscription is changed or refreshed.
    pub async fn handle(&mut self, msg: &str) -> Flow {
        let inbound = parse(msg);
        if inbound == Inbound::Oversized {
            tracing::debug!(conn_id = self.conn_id, len = msg.len(), "Oversized observer message");
            return Flow::Close;
        }

        if self.tx.send(Signal::Ack).is_err() {
            return Flow::Close;
        }

        if let Inbound::Subscribe { target, client_key } = inbound {
            // One target per connection: drop the entry held under a previous key.
            if let Some(old) = self.client_key.as_deref().filter(|old| *old != client_key) {
                self.hub.release(old, self.conn_id).await;
            }
            self.hub.subscribe(target, client_key, self.conn_id, self.tx.clone()).await;
            self.client_key = Some(client_key.to_string());
        } else if let Some(key) = &self.client_key {
            self.hub.touch(key, self.conn_id).await;
        }

        Flow::Continue
    }

    /// Release the registry entry when the connection ends.
    pub async fn close(self) {
        if let Some(key) = &self.client_key {
            self.hub.release(key, self.conn_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use tokio::sync::mpsc;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(&Limits::default()))
    }

    #[tokio::test]
    async fn test_subscribe_is_acknowledged() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(hub.clone(), tx);

        assert_eq!(session.handle("42@client").await, Flow::Continue);
        assert_eq!(rx.try_recv().unwrap(), Signal::Ack);
        assert_eq!(hub.observer_count("42").await, 1);

        hub.notify("42").await;
        assert_eq!(rx.try_recv().unwrap(), Signal::Refresh);
    }

    #[tokio::test]
    async fn test_keepalive_without_subscription_only_acks() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(hub.clone(), tx);

        assert_eq!(session.handle("ping").await, Flow::Continue);
        assert_eq!(rx.try_recv().unwrap(), Signal::Ack);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_closes_without_ack() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(hub, tx);

        assert_eq!(session.handle(&"x".repeat(51)).await, Flow::Close);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_and_close_release_entries() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(hub.clone(), tx);

        session.handle("view-a@client").await;
        session.handle("view-b@client").await;
        assert!(!hub.has_target("view-a").await);
        assert!(hub.has_target("view-b").await);

        session.close().await;
        assert!(!hub.has_target("view-b").await);
    }

    #[tokio::test]
    async fn test_subscribe_under_new_key_releases_old_entry() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(hub.clone(), tx);

        session.handle("target-a@k1").await;
        session.handle("target-b@k2").await;
        assert!(!hub.has_target("target-a").await);
        assert!(hub.has_target("target-b").await);

        while rx.try_recv().is_ok() {}
        hub.notify("target-a").await;
        assert!(rx.try_recv().is_err());

        session.close().await;
        assert!(!hub.has_target("target-a").await);
        assert!(!hub.has_target("target-b").await);
    }

    #[tokio::test]
    async fn test_close_leaves_key_taken_over_by_other_connection() {
        let hub = hub();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let mut first = Session::new(hub.clone(), tx1);
        let mut second = Session::new(hub.clone(), tx2);

        first.handle("*@client").await;
        second.handle("*@client").await;
        first.close().await;

        assert_eq!(hub.observer_count("*").await, 1);
    }
}
