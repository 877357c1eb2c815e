//! src/services/mail.rs
//!
//! Outbound email. `MailTransport` is the seam the dispatcher calls through,
//! so tests can substitute a recording double; `SmtpMailer` is the real
//! implementation speaking STARTTLS SMTP via lettre.

use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use thiserror::Error;
use tracing::info;

/// Rejection reasons for a send attempt. `InvalidRecipient` and
/// `MissingCredentials` are detected before any network I/O.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient address `{0}`")]
    InvalidRecipient(String),
    #[error("mail transport credentials are not configured")]
    MissingCredentials,
    #[error("smtp send failed: {0}")]
    Transport(String),
}

/// send(to, subject, html) -> delivered | rejected(reason).
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError>;
}

/// Cheap shape check used when accepting a recipient address from the
/// owner. The transport re-validates with a full mailbox parse at send
/// time, so this only needs to catch obvious junk early.
pub fn looks_like_email(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// SMTP mailer over a STARTTLS relay.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        if self.config.host.is_empty()
            || self.config.from.is_empty()
            || self.config.username.is_empty()
        {
            return Err(MailError::MissingCredentials);
        }

        let from_mailbox: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|_| MailError::MissingCredentials)?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|_| MailError::InvalidRecipient(to.to_string()))?;

        let email = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| MailError::Transport(format!("build message: {e}")))?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| MailError::Transport(format!("smtp relay: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        info!("email sent to {to}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape_check() {
        assert!(looks_like_email("a@b.com"));
        assert!(looks_like_email("first.last@mail.example.org"));
        assert!(!looks_like_email("not-an-email"));
        assert!(!looks_like_email("@b.com"));
        assert!(!looks_like_email("a@nodot"));
        assert!(!looks_like_email("a@.com"));
    }

    #[tokio::test]
    async fn empty_config_is_rejected_before_any_io() {
        let mailer = SmtpMailer::new(SmtpConfig::default());
        let err = mailer.send("a@example.com", "s", "b").await.unwrap_err();
        assert!(matches!(err, MailError::MissingCredentials));
    }

    #[tokio::test]
    async fn malformed_recipient_is_classified_without_io() {
        let mailer = SmtpMailer::new(SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "user".into(),
            password: "pass".into(),
            from: "Send Later <noreply@example.com>".into(),
        });
        // Recipient parse happens before the relay is contacted, so this
        // fails fast even though smtp.example.com is unreachable.
        let err = mailer.send("not-an-email", "s", "b").await.unwrap_err();
        assert!(matches!(err, MailError::InvalidRecipient(_)));
    }
}
