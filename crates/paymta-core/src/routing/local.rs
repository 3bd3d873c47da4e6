//! Local delivery, quarantine and payment bounce

use super::bounce::{build_bounce, BounceNotice};
use crate::delivery::Relay;
use crate::dkim::SignerSource;
use crate::error::{DeliveryOutcome, Rejection};
use async_trait::async_trait;
use chrono::Utc;
use paymta_common::types::Envelope;
use paymta_common::{Config, Error, Result};
use paymta_storage::{
    CredentialStore, MailboxInfo, MailboxStore, QuarantineRecord, QuarantineStore,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Payment state of a local recipient
#[async_trait]
pub trait Entitlements: Send + Sync {
    async fn is_paid(&self, recipient: &str, envelope: &Envelope) -> Result<bool>;
}

/// Every inbound message is unpaid until billing is wired in
pub struct NeverPaid;

#[async_trait]
impl Entitlements for NeverPaid {
    async fn is_paid(&self, _recipient: &str, _envelope: &Envelope) -> Result<bool> {
        Ok(false)
    }
}

/// Every inbound message goes straight to the inbox
pub struct AlwaysPaid;

#[async_trait]
impl Entitlements for AlwaysPaid {
    async fn is_paid(&self, _recipient: &str, _envelope: &Envelope) -> Result<bool> {
        Ok(true)
    }
}

/// Create a mailbox or return the one already there
pub async fn ensure_mailbox(
    store: &dyn MailboxStore,
    user: &str,
    name: &str,
) -> Result<MailboxInfo> {
    match store.create_mailbox(user, name).await {
        Ok(mailbox) => Ok(mailbox),
        Err(e) if e.is_already_exists() => store
            .get_mailbox(user, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mailbox {} of {}", name, user))),
        Err(e) => {
            warn!(user, mailbox = name, error = %e, "Failed to create mailbox");
            Err(e)
        }
    }
}

fn subject_of(data: &[u8]) -> String {
    mail_parser::MessageParser::default()
        .parse(data)
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_default()
}

/// Delivers to recipients of the served domain
pub struct LocalDelivery {
    config: Arc<Config>,
    credentials: Arc<dyn CredentialStore>,
    mailboxes: Arc<dyn MailboxStore>,
    quarantine: Arc<dyn QuarantineStore>,
    relay: Arc<dyn Relay>,
    signer: Arc<dyn SignerSource>,
    entitlements: Arc<dyn Entitlements>,
}

impl LocalDelivery {
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<dyn CredentialStore>,
        mailboxes: Arc<dyn MailboxStore>,
        quarantine: Arc<dyn QuarantineStore>,
        relay: Arc<dyn Relay>,
        signer: Arc<dyn SignerSource>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        Self {
            config,
            credentials,
            mailboxes,
            quarantine,
            relay,
            signer,
            entitlements,
        }
    }

    /// Replace the entitlement source, [`NeverPaid`] by default
    pub fn with_entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.entitlements = entitlements;
        self
    }

    pub async fn deliver(&self, recipient: &str, envelope: &Envelope) -> DeliveryOutcome {
        match self.try_deliver(recipient, envelope).await {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome::Failed(e.into()),
        }
    }

    async fn try_deliver(&self, recipient: &str, envelope: &Envelope) -> Result<DeliveryOutcome> {
        let recipient = recipient.to_ascii_lowercase();

        if !self.credentials.exists(&recipient).await? {
            return Ok(DeliveryOutcome::Rejected(Rejection::new(
                451,
                format!("Bad recipient address {:?}", recipient),
            )));
        }

        let now = Utc::now();

        if self.entitlements.is_paid(&recipient, envelope).await? {
            let inbox = ensure_mailbox(self.mailboxes.as_ref(), &recipient, "INBOX").await?;
            let uid = self
                .mailboxes
                .create_message(&inbox, &[], now, &envelope.data)
                .await?;
            info!(to = %recipient, uid, "Delivered to inbox");
            return Ok(DeliveryOutcome::Delivered);
        }

        let holding = ensure_mailbox(
            self.mailboxes.as_ref(),
            &recipient,
            &self.config.quarantine.mailbox,
        )
        .await?;
        let uid = self
            .mailboxes
            .create_message(&holding, &[], now, &envelope.data)
            .await?;

        let quarantine_id = format!("{}-{}", uid, Uuid::new_v4());
        let subject = subject_of(&envelope.data);
        let record = QuarantineRecord::new(envelope.sender.clone(), now, subject.clone(), &envelope.data);

        // The message is stored; from here on failures only get logged
        if let Err(e) = self.quarantine.put(&recipient, &quarantine_id, &record).await {
            error!(to = %recipient, id = %quarantine_id, from = %envelope.sender, error = %e, "Failed to write quarantine record");
            return Ok(DeliveryOutcome::Delivered);
        }
        info!(to = %recipient, id = %quarantine_id, "Quarantined unpaid message");

        self.send_bounce(&recipient, envelope, &quarantine_id, &subject)
            .await;

        Ok(DeliveryOutcome::Quarantined(quarantine_id))
    }

    /// Ask the original sender to pay. Never fails the inbound transaction.
    async fn send_bounce(&self, recipient: &str, original: &Envelope, quarantine_id: &str, subject: &str) {
        if original.has_null_sender() {
            info!(to = %recipient, id = %quarantine_id, "Null sender, no payment bounce");
            return;
        }

        let notice = BounceNotice::new(&self.config, recipient, original, quarantine_id, subject);
        let mut bounce = match build_bounce(&notice) {
            Ok(bounce) => bounce,
            Err(e) => {
                error!(from = %original.sender, error = %e, "Failed to create bounce email");
                return;
            }
        };

        match self.signer.signer().await {
            Ok(signer) => {
                if let Err(e) = signer.sign(&mut bounce) {
                    error!(from = %original.sender, error = %e, "Failed to sign bounce email");
                    return;
                }
            }
            Err(e) => {
                error!(from = %original.sender, error = %e, "No DKIM signer for bounce email");
                return;
            }
        }

        let timeout = self.config.delivery.bounce_timeout();
        match tokio::time::timeout(timeout, self.relay.deliver(&bounce, &original.sender)).await {
            Ok(Ok(())) => info!(to = %original.sender, id = %quarantine_id, "Sent payment bounce"),
            Ok(Err(e)) => {
                error!(to = %original.sender, error = %e, "Failed to bounce for payment")
            }
            Err(_) => error!(to = %original.sender, ?timeout, "Payment bounce timed out"),
        }
    }
}
