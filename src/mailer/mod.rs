//! Outbound email.
//!
//! [`Mailer`] composes the three letters the service sends (device down,
//! device back online, verification code) and hands them to a
//! [`Transport`] on the background queue. Callers never wait for delivery
//! and never see its errors.

mod smtp;

pub use smtp::SmtpTransport;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::MailConfig;
use crate::db::Device;
use crate::tasks::Background;

/// Error type for email delivery failures.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
}

/// A composed HTML letter.
#[derive(Debug, Clone, PartialEq)]
pub struct Letter {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Something that can deliver a letter.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, letter: Letter) -> Result<(), MailError>;
}

/// Transport used when no SMTP server is configured.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, letter: Letter) -> Result<(), MailError> {
        tracing::info!(to = %letter.to, subject = %letter.subject, "Mail not sent, SMTP is not configured");
        Ok(())
    }
}

/// Composes and queues device letters.
#[derive(Clone)]
pub struct Mailer {
    transport: Arc<dyn Transport>,
    background: Background,
    config: MailConfig,
}

impl Mailer {
    pub fn new(transport: Arc<dyn Transport>, background: Background, config: MailConfig) -> Self {
        Self {
            transport,
            background,
            config,
        }
    }

    /// Pick the SMTP transport when a host is configured, the log transport otherwise.
    pub fn from_config(config: MailConfig, background: Background) -> Self {
        let transport: Arc<dyn Transport> = match &config.smtp_host {
            Some(_) => Arc::new(SmtpTransport::new(config.clone())),
            None => Arc::new(LogTransport),
        };
        Self::new(transport, background, config)
    }

    /// Tell the owner their device stopped reporting.
    pub fn send_down(&self, device: &Device) {
        tracing::info!(device_id = device.id, "Mailing down alert");
        let letter = Letter {
            to: device.email.clone(),
            subject: format!("{} is down", device.title),
            html: format!("<h1>{} is down</h1>{}", device.title, self.footer(device)),
        };
        self.queue("mail.down", letter);
    }

    /// Tell the owner their device is back.
    pub fn send_up(&self, device: &Device) {
        tracing::info!(device_id = device.id, "Mailing up alert");
        let letter = Letter {
            to: device.email.clone(),
            subject: format!("{} is online", device.title),
            html: format!("<h1>{} is online</h1>{}", device.title, self.footer(device)),
        };
        self.queue("mail.up", letter);
    }

    /// Send the email verification code together with the permanent links.
    pub fn send_vcode(&self, device: &Device, code: &str) {
        tracing::info!(device_id = device.id, "Mailing verification code");
        let site = &self.config.site_url;
        let edit = device.edit_token.as_deref().unwrap_or_default();
        let view = device.view_token.as_deref().unwrap_or_default();
        let letter = Letter {
            to: device.email.clone(),
            subject: format!("{} - welcome to {}", device.title, self.config.domain),
            html: format!(
                "<big>Verification code: <b>{code}</b></big><br><br>\
                 Please save this message.<br>Permanent link to your device settings page:<br>\
                 {site}/e/{edit}<br><br>\
                 Your monitoring page (view-only):<br>\
                 {site}/v/{view}<br><br><br>\
                 <small>If you have not registered on our site, just ignore this message</small>"
            ),
        };
        self.queue("mail.vcode", letter);
    }

    fn footer(&self, device: &Device) -> String {
        let edit = device.edit_token.as_deref().unwrap_or_default();
        format!(
            "<br><br><big><a href=\"{site}/e/{edit}\">Change settings</a></big><br><br><br>\
             <small>You received this message because you have enabled notifications at {domain}. \
             If you do not want to receive these messages in the future, please \
             <a href=\"{unsub}{edit}\">unsubscribe</a></small>",
            site = self.config.site_url,
            domain = self.config.domain,
            unsub = self.config.unsubscribe_url,
        )
    }

    fn queue(&self, label: &'static str, letter: Letter) {
        let transport = self.transport.clone();
        self.background.spawn(label, async move {
            transport.deliver(letter).await?;
            Ok(())
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn device() -> Device {
        let mut device = Device::new(60, 150);
        device.title = "Home router".to_string();
        device.email = "owner@example.com".to_string();
        device.edit_token = Some("edittoken".to_string());
        device.view_token = Some("viewtoken".to_string());
        device
    }

    #[tokio::test]
    async fn test_down_letter() {
        let (mailer, mut rx) = recording_mailer(Background::start(4, 1));
        mailer.send_down(&device());

        let letter = next_letter(&mut rx).await.unwrap();
        assert_eq!(letter.to, "owner@example.com");
        assert_eq!(letter.subject, "Home router is down");
        assert!(letter.html.contains("/e/edittoken"));
        assert!(letter.html.contains("unsubscribe/edittoken"));
    }

    #[tokio::test]
    async fn test_vcode_letter_contains_code_and_links() {
        let (mailer, mut rx) = recording_mailer(Background::start(4, 1));
        mailer.send_vcode(&device(), "123456");

        let letter = next_letter(&mut rx).await.unwrap();
        assert!(letter.html.contains("<b>123456</b>"));
        assert!(letter.html.contains("/v/viewtoken"));
        assert!(letter.subject.starts_with("Home router - welcome to"));
    }

    #[tokio::test]
    async fn test_log_transport_accepts_everything() {
        let letter = Letter {
            to: "a@b.c".to_string(),
            subject: "s".to_string(),
            html: String::new(),
        };
        assert!(LogTransport.deliver(letter).await.is_ok());
    }
}
