//! Device management on behalf of owners and visitors.
//!
//! Owners authenticate with the edit token, visitors with the view token
//! or, for public devices, the numeric ID. Every mutation runs under the
//! same per-device lock as heartbeat processing and tells observers
//! afterwards.

mod tokens;
mod update;

pub use tokens::{random_token, verification_code, TOKEN_LENGTH};
pub use update::{is_valid_email, DeviceUpdate, ValidationError};

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::config::Limits;
use crate::db::{DbError, Device, Event, Store, TokenKind};
use crate::heartbeat::DeviceLocks;
use crate::mailer::Mailer;
use crate::watch::Notifier;

/// Attempts at drawing a token that no other device holds.
const TOKEN_ATTEMPTS: usize = 8;

/// Why a management request was not carried out.
#[derive(Error, Debug)]
pub enum ManageError {
    #[error("bad token")]
    BadToken,
    #[error("blocked")]
    Blocked,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("event not found")]
    UnknownEvent,
    #[error("could not draw a unique token")]
    TokenSpace,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A device together with its event history.
#[derive(Debug, Clone)]
pub struct DeviceDetails {
    pub device: Device,
    pub events: Vec<Event>,
}

pub struct DeviceService {
    store: Arc<Store>,
    limits: Limits,
    locks: Arc<DeviceLocks>,
    notifier: Notifier,
    mailer: Mailer,
}

impl DeviceService {
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

    // --- Read side ---

    /// Public devices, least downtime first, and the number of devices ever registered.
    pub fn listing(&self) -> Result<(Vec<Device>, i64), ManageError> {
        Ok((self.store.list_public()?, self.store.count_devices()?))
    }

    /// Resolve a view token, falling back to the ID of a public device.
    pub fn view(&self, token: &str) -> Result<DeviceDetails, ManageError> {
        let device = match self.store.find_by_token(TokenKind::View, token)? {
            Some(device) => Some(device),
            None => match token.parse::<i64>() {
                Ok(id) => self.store.find_public(id)?,
                Err(_) => None,
            },
        };
        self.details(device.ok_or(ManageError::BadToken)?)
    }

    /// Everything the owner's settings page shows.
    pub fn edit_view(&self, token: &str) -> Result<DeviceDetails, ManageError> {
        let device = self
            .store
            .find_by_token(TokenKind::Edit, token)?
            .ok_or(ManageError::BadToken)?;
        self.details(device)
    }

    fn details(&self, device: Device) -> Result<DeviceDetails, ManageError> {
        let events = self.store.events_for_device(device.id)?;
        Ok(DeviceDetails { device, events })
    }

    // --- Registration ---

    /// Register a new device for a client at `ip`.
    pub async fn create(&self, ip: &str, now: DateTime<Utc>) -> Result<Device, ManageError> {
        let recent = self
            .store
            .count_registrations_since(ip, now - Duration::days(1))?;
        if recent > self.limits.reg_per_ip {
            tracing::warn!(ip, recent, "Registration blocked");
            return Err(ManageError::Blocked);
        }

        let mut device = Device::new(
            self.limits.default_interval,
            self.limits.default_notify_interval(),
        );
        for kind in TokenKind::ALL {
            device.set_token(kind, Some(self.unique_token(kind)?));
        }
        device.created = Some(now);
        device.last_ip = Some(ip.to_string());

        let id = self.store.insert_device(&mut device)?;
        device.title = format!("Device {}", id);
        self.store.save_device(&device)?;

        tracing::info!(device_id = id, "Device registered");
        Ok(device)
    }

    fn unique_token(&self, kind: TokenKind) -> Result<String, ManageError> {
        for _ in 0..TOKEN_ATTEMPTS {
            let token = random_token();
            if !self.store.token_in_use(kind, &token)? {
                return Ok(token);
            }
        }
        Err(ManageError::TokenSpace)
    }

    // --- Owner operations ---

    /// Lock the device owning `token` and load its current state.
    async fn owned(&self, token: &str) -> Result<(OwnedMutexGuard<()>, Device), ManageError> {
        let found = self
            .store
            .find_by_token(TokenKind::Edit, token)?
            .ok_or(ManageError::BadToken)?;
        let guard = self.locks.lock(found.id).await;
        match self.store.get_device(found.id)? {
            Some(device) if device.edit_token.as_deref() == Some(token) => Ok((guard, device)),
            _ => Err(ManageError::BadToken),
        }
    }

    /// Apply an owner edit. Nothing is stored when any field is rejected.
    pub async fn update(&self, token: &str, update: DeviceUpdate) -> Result<Device, ManageError> {
        let (_guard, mut device) = self.owned(token).await?;
        update.apply(&mut device, &self.limits)?;
        self.store.save_device(&device)?;
        self.notifier.notify_device(&device);
        Ok(device)
    }

    /// Store `email` and mail it a fresh verification code.
    pub async fn send_code(
        &self,
        token: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ManageError> {
        let (_guard, mut device) = self.owned(token).await?;
        if !is_valid_email(email) {
            return Err(ValidationError::IncorrectEmail.into());
        }

        device.email = email.to_string();
        device.email_confirmed = false;

        let window_open = device
            .email_sent
            .is_some_and(|sent| sent >= now - Duration::days(1));
        if !window_open {
            device.email_sent = Some(now);
            device.email_count = 0;
            device.email_errors = 0;
        }

        if device.email_count >= self.limits.email_max_sent
            || device.email_errors >= self.limits.email_vcode_attempt
        {
            tracing::warn!(device_id = device.id, "Verification code blocked");
            return Err(ManageError::Blocked);
        }

        let code = verification_code();
        device.email_vcode = Some(code.clone());
        device.email_count += 1;
        self.store.save_device(&device)?;

        self.mailer.send_vcode(&device, &code);
        self.notifier.notify_device(&device);
        Ok(())
    }

    /// Check a verification code. Returns whether the email is now confirmed.
    pub async fn verify(&self, token: &str, code: &str) -> Result<bool, ManageError> {
        let (_guard, mut device) = self.owned(token).await?;
        if device.email_errors >= self.limits.email_vcode_attempt {
            return Err(ManageError::Blocked);
        }

        let confirmed = device.email_vcode.as_deref() == Some(code);
        if confirmed {
            device.email_confirmed = true;
        } else {
            device.email_errors += 1;
        }
        self.store.save_device(&device)?;

        if confirmed {
            tracing::info!(device_id = device.id, "Email confirmed");
            self.notifier.notify_device(&device);
        }
        Ok(confirmed)
    }

    /// Replace one token. Observers of the old token are told before it stops working.
    pub async fn change_token(&self, token: &str, kind: TokenKind) -> Result<String, ManageError> {
        let (_guard, mut device) = self.owned(token).await?;
        let previous = device.clone();

        let fresh = self.unique_token(kind)?;
        device.set_token(kind, Some(fresh.clone()));
        self.store.set_token(device.id, kind, &fresh)?;

        tracing::info!(device_id = device.id, kind = kind.column(), "Token changed");
        self.notifier.notify_device(&previous);
        Ok(fresh)
    }

    /// Stop all email to the owner.
    pub async fn unsubscribe(&self, token: &str) -> Result<Device, ManageError> {
        let (_guard, mut device) = self.owned(token).await?;
        device.email.clear();
        device.email_confirmed = false;
        self.store.save_device(&device)?;
        self.notifier.notify_device(&device);
        Ok(device)
    }

    /// Exclude an event from the corrected downtime, or include it again.
    pub async fn toggle_event(&self, token: &str, event_id: i64) -> Result<(), ManageError> {
        let (_guard, device) = self.owned(token).await?;
        let device = self
            .store
            .toggle_event(device.id, event_id)?
            .ok_or(ManageError::UnknownEvent)?;
        self.notifier.notify_device(&device);
        Ok(())
    }

    pub async fn add_comment(
        &self,
        token: &str,
        event_id: i64,
        comment: &str,
    ) -> Result<(), ManageError> {
        if comment.chars().count() > 150 {
            return Err(ValidationError::TooLong("comment").into());
        }
        let (_guard, device) = self.owned(token).await?;
        let device = self
            .store
            .set_event_comment(device.id, event_id, comment)?
            .ok_or(ManageError::UnknownEvent)?;
        self.notifier.notify_device(&device);
        Ok(())
    }

    /// Drop the history and revoke every token. The ID stays reserved.
    pub async fn delete(&self, token: &str) -> Result<(), ManageError> {
        let (_guard, device) = self.owned(token).await?;
        self.store.delete_device(device.id)?;
        tracing::info!(device_id = device.id, "Device deleted");
        self.notifier.notify_device(&device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{temp_store, NewEvent};
    use crate::mailer::testing::{next_letter, recording_mailer};
    use crate::mailer::Letter;
    use crate::tasks::Background;
    use crate::watch::{Hub, Signal};
    use chrono::TimeZone;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    const IP: &str = "192.0.2.10";

    struct Fixture {
        _tmp: tempfile::NamedTempFile,
        store: Arc<Store>,
        hub: Arc<Hub>,
        service: DeviceService,
        letters: mpsc::UnboundedReceiver<Letter>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 9, 30, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let (tmp, store) = temp_store();
        let limits = Limits::default();
        let background = Background::start(64, 4);
        let hub = Arc::new(Hub::new(&limits));
        let notifier = Notifier::new(hub.clone(), background.clone());
        let (mailer, letters) = recording_mailer(background);
        let service = DeviceService::new(
            store.clone(),
            limits,
            Arc::new(DeviceLocks::new()),
            notifier,
            mailer,
        );
        Fixture {
            _tmp: tmp,
            store,
            hub,
            service,
            letters,
        }
    }

    fn edit_token(device: &Device) -> String {
        device.edit_token.clone().unwrap()
    }

    #[tokio::test]
    async fn test_create_device() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);

        assert_eq!(device.title, format!("Device {}", device.id));
        assert_eq!(device.interval, 60);
        assert_eq!(device.notify_interval, 150);
        assert_eq!(device.created, Some(t0()));
        assert_eq!(device.last_ip.as_deref(), Some(IP));
        assert_eq!(device.last_seen, None);
        for kind in TokenKind::ALL {
            let token = device.token(kind).unwrap();
            assert_eq!(token.len(), TOKEN_LENGTH);
        }

        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert_eq!(stored, device);
    }

    #[tokio::test]
    async fn test_registration_throttle() {
        let f = fixture();
        for _ in 0..=Limits::default().reg_per_ip {
            f.service.create(IP, t0()).await.unwrap();
        }
        assert!(matches!(
            f.service.create(IP, t0()).await,
            Err(ManageError::Blocked)
        ));

        // Other addresses and later days are unaffected.
        f.service.create("198.51.100.1", t0()).await.unwrap();
        f.service.create(IP, t0() + Duration::days(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_view_by_token_or_public_id() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let view = device.view_token.clone().unwrap();

        assert_eq!(f.service.view(&view).unwrap().device.id, device.id);
        assert!(matches!(
            f.service.view(&device.id.to_string()),
            Err(ManageError::BadToken)
        ));

        let update = DeviceUpdate {
            public: Some(true),
            ..Default::default()
        };
        f.service.update(&edit_token(&device), update).await.unwrap();
        assert_eq!(
            f.service.view(&device.id.to_string()).unwrap().device.id,
            device.id
        );
    }

    #[tokio::test]
    async fn test_update_rejected_stores_nothing() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);

        let update = DeviceUpdate {
            title: Some("Renamed".to_string()),
            interval: Some(10),
            ..Default::default()
        };
        let err = assert_err!(f.service.update(&edit_token(&device), update).await);
        assert!(matches!(
            err,
            ManageError::Invalid(ValidationError::IncorrectInterval)
        ));

        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert_eq!(stored.title, device.title);
    }

    #[tokio::test]
    async fn test_update_notifies_observers() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.hub
            .subscribe(device.view_token.as_deref().unwrap(), "client", 1, tx)
            .await;

        let update = DeviceUpdate {
            notes: Some("UPS in the hallway".to_string()),
            ..Default::default()
        };
        f.service.update(&edit_token(&device), update).await.unwrap();

        let signal = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(Signal::Refresh));
    }

    #[tokio::test]
    async fn test_email_verification_flow() {
        let mut f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);

        f.service
            .send_code(&token, "owner@example.com", t0())
            .await
            .unwrap();
        let letter = next_letter(&mut f.letters).await.unwrap();
        assert_eq!(letter.to, "owner@example.com");

        let stored = f.store.get_device(device.id).unwrap().unwrap();
        let code = stored.email_vcode.clone().unwrap();
        assert!(letter.html.contains(&code));
        assert_eq!(stored.email_count, 1);

        assert!(!f.service.verify(&token, "000000").await.unwrap());
        assert!(f.service.verify(&token, &code).await.unwrap());

        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert!(stored.email_confirmed);
        assert_eq!(stored.email_errors, 1);
    }

    #[tokio::test]
    async fn test_send_code_limit_and_window_reset() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);

        for _ in 0..3 {
            f.service.send_code(&token, "a@example.com", t0()).await.unwrap();
        }
        assert!(matches!(
            f.service.send_code(&token, "a@example.com", t0()).await,
            Err(ManageError::Blocked)
        ));

        let tomorrow = t0() + Duration::days(1) + Duration::seconds(1);
        f.service.send_code(&token, "a@example.com", tomorrow).await.unwrap();
        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert_eq!(stored.email_count, 1);
        assert_eq!(stored.email_sent, Some(tomorrow));
    }

    #[tokio::test]
    async fn test_send_code_rejects_bad_address() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        assert!(matches!(
            f.service.send_code(&edit_token(&device), "nope", t0()).await,
            Err(ManageError::Invalid(ValidationError::IncorrectEmail))
        ));
    }

    #[tokio::test]
    async fn test_verify_blocked_after_attempts() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);
        f.service.send_code(&token, "a@example.com", t0()).await.unwrap();

        for _ in 0..Limits::default().email_vcode_attempt {
            assert!(!f.service.verify(&token, "wrong").await.unwrap());
        }
        assert!(matches!(
            f.service.verify(&token, "wrong").await,
            Err(ManageError::Blocked)
        ));
        assert!(matches!(
            f.service.send_code(&token, "a@example.com", t0()).await,
            Err(ManageError::Blocked)
        ));
    }

    #[tokio::test]
    async fn test_change_token() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);
        let old_view = device.view_token.clone().unwrap();

        let fresh = f.service.change_token(&token, TokenKind::View).await.unwrap();

        assert_ne!(fresh, old_view);
        assert!(matches!(f.service.view(&old_view), Err(ManageError::BadToken)));
        assert_eq!(f.service.view(&fresh).unwrap().device.id, device.id);
    }

    #[tokio::test]
    async fn test_changed_edit_token_locks_out_old_one() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);

        let fresh = f.service.change_token(&token, TokenKind::Edit).await.unwrap();

        assert!(matches!(
            f.service.unsubscribe(&token).await,
            Err(ManageError::BadToken)
        ));
        f.service.unsubscribe(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_email() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let update = DeviceUpdate {
            email: Some("a@example.com".to_string()),
            ..Default::default()
        };
        f.service.update(&edit_token(&device), update).await.unwrap();

        let device = f.service.unsubscribe(&edit_token(&device)).await.unwrap();
        assert!(device.email.is_empty());
        assert!(!device.email_confirmed);
    }

    #[tokio::test]
    async fn test_event_operations() {
        let f = fixture();
        let mut device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);

        let event = NewEvent {
            started: Some(t0()),
            downtime: Some(300),
            ..NewEvent::new(t0() + Duration::seconds(300))
        };
        device.downtime = 300;
        device.downtime_uncrossed = 300;
        let event_id = f.store.record_heartbeat(&device, Some(&event)).unwrap().unwrap();

        f.service.toggle_event(&token, event_id).await.unwrap();
        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert_eq!(stored.downtime, 300);
        assert_eq!(stored.downtime_uncrossed, 0);

        f.service.add_comment(&token, event_id, "planned outage").await.unwrap();
        let details = f.service.edit_view(&token).unwrap();
        assert!(details.events[0].crossed);
        assert_eq!(details.events[0].comment.as_deref(), Some("planned outage"));
        assert_eq!(details.device.version, stored.version + 1);

        assert!(matches!(
            f.service.toggle_event(&token, event_id + 100).await,
            Err(ManageError::UnknownEvent)
        ));
    }

    #[tokio::test]
    async fn test_delete_device() {
        let f = fixture();
        let device = assert_ok!(f.service.create(IP, t0()).await);
        let token = edit_token(&device);

        f.service.delete(&token).await.unwrap();

        assert!(matches!(f.service.edit_view(&token), Err(ManageError::BadToken)));
        let stored = f.store.get_device(device.id).unwrap().unwrap();
        assert!(stored.update_token.is_none());
        assert!(!stored.public);

        // The ID is never handed out again.
        let next = f.service.create("198.51.100.1", t0()).await.unwrap();
        assert!(next.id > device.id);
    }
}
