//! Access notification dispatch.
//!
//! A successful authorization is mailed to the key's recipients before
//! the secret leaves the process. Delivery failure aborts the release:
//! the operator must never be silently unaware that the audit trail is
//! broken. No relay configured means dispatch is a no-op, not an error.

use std::net::SocketAddr;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::verify::{VerifiedChain, signature_hex, subject_string};
use crate::{Error, Result};

/// One successful key access, as reported to operators.
#[derive(Debug)]
pub struct AccessEvent<'a> {
    /// Validated key path relative to the data directory.
    pub key_path: &'a str,
    /// Caller's network address.
    pub remote_addr: SocketAddr,
    /// Recipients from the key's `email_to`. Empty skips dispatch.
    pub email_to: &'a [String],
    /// All authorizing chains; the first leaf is the authorizing identity.
    pub chains: &'a [VerifiedChain],
}

/// Dispatches a notification describing a key access.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver the notification, or fail the request trying.
    async fn notify(&self, event: &AccessEvent<'_>) -> Result<()>;
}

/// Dispatcher used when no SMTP relay is configured.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, event: &AccessEvent<'_>) -> Result<()> {
        debug!(key = event.key_path, "no SMTP relay configured, skipping notification");
        Ok(())
    }
}

/// SMTP dispatcher sending through a plain relay.
#[derive(Debug)]
pub struct SmtpNotifier {
    host: String,
    port: u16,
    from: String,
}

impl SmtpNotifier {
    /// Dispatcher sending via `host:port` from the given sender address.
    #[must_use]
    pub fn new(host: String, port: u16, from: String) -> Self {
        Self { host, port, from }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, event: &AccessEvent<'_>) -> Result<()> {
        if event.email_to.is_empty() {
            debug!(key = event.key_path, "no notification recipients for key");
            return Ok(());
        }

        let from: Mailbox = format!("Key Escrow Daemon <{}>", self.from)
            .parse()
            .map_err(|e| Error::Notification(format!("invalid sender address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("Access to key {}", event.key_path))
            .header(ContentType::TEXT_PLAIN);
        for recipient in event.email_to {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| Error::Notification(format!("invalid recipient {recipient:?}: {e}")))?;
            builder = builder.to(to);
        }

        let message = builder
            .body(render_body(event))
            .map_err(|e| Error::Notification(format!("failed to build message: {e}")))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
            .port(self.port)
            .build();
        mailer
            .send(message)
            .await
            .map_err(|e| Error::Notification(format!("SMTP delivery failed: {e}")))?;

        Ok(())
    }
}

/// Plain-text notification body: timestamp, caller, key, authorizing
/// certificate, and every chain that verified.
#[must_use]
pub fn render_body(event: &AccessEvent<'_>) -> String {
    let leaf = event.chains[0].leaf();
    let signature = signature_hex(leaf);
    let sig_prefix: String = signature.chars().take(16).collect();

    let mut body = format!(
        "Key: {}\nAccessed by: {}\nOn: {}\n\nClient certificate:\n  Signature: {}...\n  Subject: {}\n\nAuthorizing chains:\n",
        event.key_path,
        event.remote_addr,
        chrono::Local::now().to_rfc2822(),
        sig_prefix,
        subject_string(leaf),
    );
    for chain in event.chains {
        body.push_str(&format!("  {chain}\n"));
    }
    body
}
