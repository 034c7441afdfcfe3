//! Message submission transport
//!
//! Syncback send tasks hand fully rendered MIME to this seam. The production
//! implementation is lettre over SMTP; tests inject failures per recipient.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Deserialize;

use crate::error::HeimdallResult;

/// Delivery seam used by send tasks, one recipient per call
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_raw(&self, from: &str, recipient: &str, mime: &[u8]) -> HeimdallResult<()>;
}

/// The subset of the opaque connection-settings blob this adapter reads
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpCredentials {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
}

/// SMTP submission via lettre
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    /// Build a relay transport from the account's connection settings
    pub fn connect(connection_settings: &serde_json::Value) -> HeimdallResult<Self> {
        let creds: SmtpCredentials = serde_json::from_value(connection_settings.clone())?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&creds.smtp_host)?
            .port(creds.smtp_port)
            .credentials(Credentials::new(creds.smtp_username, creds.smtp_password))
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send_raw(&self, from: &str, recipient: &str, mime: &[u8]) -> HeimdallResult<()> {
        let sender: Address = from.parse()?;
        let rcpt: Address = recipient.parse()?;
        let envelope = lettre::address::Envelope::new(Some(sender), vec![rcpt])?;
        self.transport.send_raw(&envelope, mime).await?;
        Ok(())
    }
}
