//! SMTP delivery via `lettre`.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{Letter, MailError, Transport};
use crate::config::MailConfig;

/// Delivers letters through a STARTTLS relay.
pub struct SmtpTransport {
    config: MailConfig,
}

impl SmtpTransport {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn relay(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let host = self
            .config
            .smtp_host
            .as_deref()
            .ok_or_else(|| MailError::Build("SMTP host is not configured".to_string()))?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(self.config.smtp_port);

        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(&self, letter: Letter) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.config.from_address.parse()?)
            .to(letter.to.parse()?)
            .subject(letter.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(letter.html)
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.relay()?.send(message).await?;

        tracing::info!(to = %letter.to, subject = %letter.subject, "Mail sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bad_recipient_is_rejected_before_connecting() {
        let config = MailConfig {
            smtp_host: Some("smtp.invalid".to_string()),
            smtp_port: 587,
            from_address: "Blackouts <noreply@example.com>".to_string(),
            ..Default::default()
        };
        let letter = Letter {
            to: "not-an-email".to_string(),
            subject: "x".to_string(),
            html: String::new(),
        };

        let err = SmtpTransport::new(config).deliver(letter).await.unwrap_err();
        assert!(matches!(err, MailError::Address(_)));
    }

    #[test]
    fn test_relay_requires_host() {
        let transport = SmtpTransport::new(MailConfig::default());
        assert!(matches!(transport.relay(), Err(MailError::Build(_))));
    }
}
