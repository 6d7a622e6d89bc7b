//! Fan a device change out to every target that shows the device.

use std::sync::Arc;

use super::hub::{Hub, WILDCARD};
use crate::db::Device;
use crate::tasks::Background;

/// Derives notification targets from devices and dispatches them.
#[derive(Clone)]
pub struct Notifier {
    hub: Arc<Hub>,
    background: Background,
}

impl Notifier {
    pub fn new(hub: Arc<Hub>, background: Background) -> Self {
        Self { hub, background }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Targets whose observers must refresh after `device` changed: its view
    /// and edit tokens, plus its ID and the wildcard when it is public.
    pub fn targets_for(device: &Device) -> Vec<String> {
        let mut targets = Vec::with_capacity(4);
        if device.public {
            targets.push(device.id.to_string());
            targets.push(WILDCARD.to_string());
        }
        for token in [&device.view_token, &device.edit_token].into_iter().flatten() {
            if !token.is_empty() {
                targets.push(token.clone());
            }
        }
        targets
    }

    /// Queue one independent push per target of `device`.
    pub fn notify_device(&self, device: &Device) {
        for target in Self::targets_for(device) {
            let hub = self.hub.clone();
            self.background.spawn("notify", async move {
                hub.notify(&target).await;
                Ok(())
            });
        }
    }
}
