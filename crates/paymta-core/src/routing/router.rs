//! Per-message routing decision

use super::local::{ensure_mailbox, Entitlements, LocalDelivery, NeverPaid};
use crate::delivery::Relay;
use crate::dkim::SignerSource;
use crate::error::{DeliveryOutcome, Rejection};
use chrono::{Local, Utc};
use paymta_common::types::{EmailAddress, Envelope, Peer};
use paymta_common::Config;
use paymta_storage::{CredentialStore, MailboxStore, MessageFlag, QuarantineStore};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Positive reply to DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(250, "2.0.0 OK: queued")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Abuse report, logged and acknowledged
    Abuse,
    /// Authenticated user sending out
    Outbound,
    /// Mail for the served domain
    Inbound,
}

/// What happened to each recipient of one message
#[derive(Debug)]
pub struct Routed {
    pub direction: Direction,
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl Routed {
    /// The first failed recipient, in envelope order
    pub fn first_failure(&self) -> Option<(&str, &DeliveryOutcome)> {
        self.outcomes
            .iter()
            .find(|(_, outcome)| outcome.is_failure())
            .map(|(rcpt, outcome)| (rcpt.as_str(), outcome))
    }
}

pub struct Router {
    config: Arc<Config>,
    mailboxes: Arc<dyn MailboxStore>,
    relay: Arc<dyn Relay>,
    signer: Arc<dyn SignerSource>,
    local: LocalDelivery,
}

impl Router {
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<dyn CredentialStore>,
        mailboxes: Arc<dyn MailboxStore>,
        quarantine: Arc<dyn QuarantineStore>,
        relay: Arc<dyn Relay>,
        signer: Arc<dyn SignerSource>,
    ) -> Self {
        let local = LocalDelivery::new(
            config.clone(),
            credentials,
            mailboxes.clone(),
            quarantine,
            relay.clone(),
            signer.clone(),
            Arc::new(NeverPaid),
        );
        Self {
            config,
            mailboxes,
            relay,
            signer,
            local,
        }
    }

    pub fn with_entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.local = self.local.with_entitlements(entitlements);
        self
    }

    /// Handle a received message and produce the reply to DATA
    pub async fn handle(&self, peer: &Peer, mut envelope: Envelope) -> Result<Reply, Rejection> {
        let span = tracing::info_span!(
            "message",
            uuid = %Uuid::new_v4(),
            from = %envelope.sender,
            peer = %peer.addr.ip(),
        );

        async move {
            let routed = self.route(peer, &mut envelope).await;

            if routed.direction == Direction::Abuse {
                return Ok(Reply::new(250, "Thank you."));
            }

            match routed.first_failure() {
                Some((rcpt, outcome)) => {
                    match outcome {
                        DeliveryOutcome::Failed(e) => {
                            error!(to = %rcpt, error = %e, "Failed to handle mail")
                        }
                        other => warn!(to = %rcpt, outcome = ?other, "Rejected mail"),
                    }
                    Err(outcome.to_rejection().unwrap_or_else(Rejection::temporary))
                }
                None => {
                    info!(recipients = routed.outcomes.len(), "Handled mail successfully");
                    Ok(Reply::ok())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Classify the message and deliver it to every recipient
    pub async fn route(&self, peer: &Peer, envelope: &mut Envelope) -> Routed {
        envelope.add_received_line(peer, &self.config.server.hostname, Local::now());

        if self.is_abuse_report(envelope) {
            warn!(to = ?envelope.recipients, "Abuse email report");
            return Routed {
                direction: Direction::Abuse,
                outcomes: Vec::new(),
            };
        }

        if let Some(user) = peer.authenticated_user() {
            let outcomes = self.forward(user, envelope).await;
            return Routed {
                direction: Direction::Outbound,
                outcomes,
            };
        }

        let mut outcomes = Vec::with_capacity(envelope.recipients.len());
        for rcpt in &envelope.recipients {
            let outcome = match EmailAddress::parse(rcpt) {
                None => {
                    warn!(recipient = %rcpt, "Failed to parse recipient");
                    DeliveryOutcome::Rejected(Rejection::new(
                        553,
                        "5.1.3 Bad recipient address syntax",
                    ))
                }
                Some(addr) if addr.is_in_domain(&self.config.server.domain) => {
                    self.local.deliver(&addr.to_string(), envelope).await
                }
                Some(_) => DeliveryOutcome::Rejected(Rejection::new(
                    451,
                    "Bad recipient address. We are no open relay.",
                )),
            };
            outcomes.push((rcpt.clone(), outcome));
        }

        Routed {
            direction: Direction::Inbound,
            outcomes,
        }
    }

    fn is_abuse_report(&self, envelope: &Envelope) -> bool {
        let prefix = self.config.smtp.abuse_prefix.as_str();
        envelope.recipients.first().map_or(false, |first| {
            first.len() >= prefix.len()
                && first.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        })
    }

    /// Sign, relay to each recipient, then keep a copy in Sent
    async fn forward(&self, user: &str, envelope: &mut Envelope) -> Vec<(String, DeliveryOutcome)> {
        let signed = match self.signer.signer().await {
            Ok(signer) => signer.sign(envelope),
            Err(e) => Err(e),
        };
        if let Err(e) = signed {
            error!(user, error = %e, "Failed to DKIM sign outbound mail");
            return envelope
                .recipients
                .iter()
                .map(|rcpt| {
                    let cause = anyhow::anyhow!("failed to generate DKIM signature: {}", e);
                    (rcpt.clone(), DeliveryOutcome::Failed(cause))
                })
                .collect();
        }

        let mut outcomes = Vec::with_capacity(envelope.recipients.len());
        for rcpt in &envelope.recipients {
            let outcome = match self.relay.deliver(envelope, rcpt).await {
                Ok(()) => {
                    info!(user, to = %rcpt, "Relayed outbound mail");
                    DeliveryOutcome::Delivered
                }
                Err(e) => DeliveryOutcome::Failed(e.into()),
            };
            outcomes.push((rcpt.clone(), outcome));
        }

        self.archive_sent(user, envelope).await;
        outcomes
    }

    async fn archive_sent(&self, user: &str, envelope: &Envelope) {
        let user = user.to_ascii_lowercase();
        let sent = match ensure_mailbox(self.mailboxes.as_ref(), &user, "Sent").await {
            Ok(sent) => sent,
            Err(e) => {
                error!(user = %user, error = %e, "Failed to open Sent mailbox");
                return;
            }
        };
        if let Err(e) = self
            .mailboxes
            .create_message(&sent, &[MessageFlag::Seen], Utc::now(), &envelope.data)
            .await
        {
            error!(user = %user, error = %e, "Failed to archive sent mail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Relay;
    use crate::dkim::{DkimError, DkimSigner, DkimSigningConfig, SigningKey, StaticSignerSource};
    use crate::error::DeliveryError;
    use crate::routing::AlwaysPaid;
    use async_trait::async_trait;
    use paymta_storage::{FileMailboxStore, MailboxInfo, MemoryCredentialStore, MemoryQuarantineStore};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<(String, Envelope)>>,
        fail: bool,
    }

    impl RecordingRelay {
        fn sent(&self) -> Vec<(String, Envelope)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Relay for RecordingRelay {
        async fn deliver(&self, envelope: &Envelope, recipient: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), envelope.clone()));
            if self.fail {
                return Err(DeliveryError::NoMailExchangers("remote.org".into()));
            }
            Ok(())
        }
    }

    struct MissingKey;

    #[async_trait]
    impl SignerSource for MissingKey {
        async fn signer(&self) -> Result<Arc<DkimSigner>, DkimError> {
            Err(DkimError::Key("no key".into()))
        }
    }

    struct Harness {
        _dir: TempDir,
        router: Router,
        relay: Arc<RecordingRelay>,
        mailboxes: Arc<FileMailboxStore>,
        quarantine: Arc<MemoryQuarantineStore>,
    }

    fn config() -> Arc<Config> {
        Arc::new(
            Config::from_toml(
                r#"
[server]
hostname = "mx.example.com"
domain = "example.com"

[database]
backend = "memory"

[smtp]
listeners = []
"#,
            )
            .unwrap(),
        )
    }

    fn signer() -> Arc<dyn SignerSource> {
        Arc::new(StaticSignerSource::new(DkimSigner::new(
            DkimSigningConfig::new("example.com", "default"),
            SigningKey::ed25519(ed25519_dalek::SigningKey::from_bytes(&[3u8; 32])),
        )))
    }

    async fn harness_with(relay: RecordingRelay, signer: Arc<dyn SignerSource>) -> Harness {
        let dir = TempDir::new().unwrap();
        let credentials = Arc::new(MemoryCredentialStore::new());
        credentials
            .add_credential("alice@example.com", "secret")
            .await
            .unwrap();
        let mailboxes = Arc::new(FileMailboxStore::new(dir.path()).unwrap());
        let quarantine = Arc::new(MemoryQuarantineStore::new());
        let relay = Arc::new(relay);

        let router = Router::new(
            config(),
            credentials,
            mailboxes.clone(),
            quarantine.clone(),
            relay.clone(),
            signer,
        );
        Harness {
            _dir: dir,
            router,
            relay,
            mailboxes,
            quarantine,
        }
    }

    async fn harness() -> Harness {
        harness_with(RecordingRelay::default(), signer()).await
    }

    fn peer() -> Peer {
        let mut peer = Peer::new("198.51.100.4:40000".parse().unwrap());
        peer.helo = "client.remote.org".into();
        peer.extended = true;
        peer
    }

    fn authenticated() -> Peer {
        let mut peer = peer();
        peer.username = Some("alice@example.com".into());
        peer
    }

    fn message(sender: &str, recipients: &[&str]) -> Envelope {
        Envelope::new(
            sender,
            recipients.iter().map(|r| r.to_string()).collect(),
            b"From: sender@remote.org\r\nSubject: Offer\r\n\r\nbuy now\r\n".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_abuse_report_is_acknowledged() {
        let h = harness().await;
        let reply = h
            .router
            .handle(&peer(), message("x@remote.org", &["abuse@example.com", "alice@example.com"]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::new(250, "Thank you."));
        assert!(h.relay.sent().is_empty());
        assert_eq!(h.quarantine.len().await, 0);
    }

    #[tokio::test]
    async fn test_unpaid_mail_is_quarantined_and_bounced() {
        let h = harness().await;
        let reply = h
            .router
            .handle(&peer(), message("sender@remote.org", &["alice@example.com"]))
            .await
            .unwrap();
        assert_eq!(reply.code, 250);

        assert_eq!(h.quarantine.len().await, 1);
        let ids = h.quarantine.ids("alice@example.com").await;
        assert!(ids[0].starts_with("1-"));

        let holding = MailboxInfo::new("alice@example.com", "UNPAID");
        assert_eq!(h.mailboxes.message_count(&holding).await.unwrap(), 1);
        let stored = h.mailboxes.read_message(&holding, 1).await.unwrap();
        assert!(stored.starts_with(b"Received: from client.remote.org ([198.51.100.4]) by mx.example.com"));

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 1);
        let (to, bounce) = &sent[0];
        assert_eq!(to, "sender@remote.org");
        assert_eq!(bounce.sender, "info@example.com");
        let text = String::from_utf8_lossy(&bounce.data);
        assert!(text.starts_with("DKIM-Signature: "));
        assert!(text.contains(&format!("https://example.com/pay/alice/{}", ids[0])));
    }

    #[tokio::test]
    async fn test_quarantine_ids_are_distinct() {
        let h = harness().await;
        for _ in 0..2 {
            h.router
                .handle(&peer(), message("sender@remote.org", &["alice@example.com"]))
                .await
                .unwrap();
        }
        let mut ids = h.quarantine.ids("alice@example.com").await;
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_null_sender_gets_no_bounce() {
        let h = harness().await;
        h.router
            .handle(&peer(), message("", &["alice@example.com"]))
            .await
            .unwrap();
        assert_eq!(h.quarantine.len().await, 1);
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bounce_does_not_fail_the_message() {
        let relay = RecordingRelay {
            fail: true,
            ..Default::default()
        };
        let h = harness_with(relay, signer()).await;
        let reply = h
            .router
            .handle(&peer(), message("sender@remote.org", &["alice@example.com"]))
            .await;
        assert!(reply.is_ok());
        assert_eq!(h.relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_paid_mail_goes_to_inbox() {
        let mut h = harness().await;
        h.router = h.router.with_entitlements(Arc::new(AlwaysPaid));
        h.router
            .handle(&peer(), message("sender@remote.org", &["alice@example.com"]))
            .await
            .unwrap();

        let inbox = MailboxInfo::new("alice@example.com", "INBOX");
        assert_eq!(h.mailboxes.message_count(&inbox).await.unwrap(), 1);
        assert_eq!(h.quarantine.len().await, 0);
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_reports_first_error() {
        let h = harness().await;
        let mut envelope = message(
            "sender@remote.org",
            &["not-an-address", "alice@example.com", "bob@other.org"],
        );
        let routed = h.router.route(&peer(), &mut envelope).await;

        assert_eq!(routed.direction, Direction::Inbound);
        assert_eq!(routed.outcomes.len(), 3);
        assert!(matches!(routed.outcomes[1].1, DeliveryOutcome::Quarantined(_)));
        assert_eq!(
            routed.outcomes[2].1.to_rejection(),
            Some(Rejection::new(451, "Bad recipient address. We are no open relay."))
        );
        let (rcpt, _) = routed.first_failure().unwrap();
        assert_eq!(rcpt, "not-an-address");

        let err = h.router.handle(&peer(), envelope).await.unwrap_err();
        assert_eq!(err.code, 553);
        assert_eq!(h.quarantine.len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_local_recipient() {
        let h = harness().await;
        let err = h
            .router
            .handle(&peer(), message("sender@remote.org", &["nobody@example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::new(451, "Bad recipient address \"nobody@example.com\""));
    }

    #[tokio::test]
    async fn test_open_relay_is_refused() {
        let h = harness().await;
        let err = h
            .router
            .handle(&peer(), message("sender@remote.org", &["someone@elsewhere.net"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, 451);
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_mail_is_signed_relayed_and_archived() {
        let h = harness().await;
        let reply = h
            .router
            .handle(
                &authenticated(),
                message("alice@example.com", &["bob@remote.org", "carol@remote.org"]),
            )
            .await
            .unwrap();
        assert_eq!(reply.code, 250);

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 2);
        let data = String::from_utf8_lossy(&sent[0].1.data).to_string();
        assert!(data.starts_with("DKIM-Signature: "));
        let received = data.find("Received: ").unwrap();
        assert!(received > 0);

        let archive = MailboxInfo::new("alice@example.com", "Sent");
        assert_eq!(h.mailboxes.message_count(&archive).await.unwrap(), 1);
        assert_eq!(
            h.mailboxes.message_flags(&archive, 1).await.unwrap(),
            vec![MessageFlag::Seen]
        );
    }

    #[tokio::test]
    async fn test_headers_only_message_is_relayed() {
        let h = harness().await;
        let envelope = Envelope::new(
            "alice@example.com",
            vec!["bob@remote.org".to_string()],
            b"From: alice@example.com\r\nTo: bob@remote.org\r\nSubject: ping\r\n".to_vec(),
        );
        let reply = h.router.handle(&authenticated(), envelope).await.unwrap();
        assert_eq!(reply.code, 250);

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.data.starts_with(b"DKIM-Signature: "));
        let archive = MailboxInfo::new("alice@example.com", "Sent");
        assert_eq!(h.mailboxes.message_count(&archive).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signing_failure_fails_outbound() {
        let h = harness_with(RecordingRelay::default(), Arc::new(MissingKey)).await;
        let err = h
            .router
            .handle(&authenticated(), message("alice@example.com", &["bob@remote.org"]))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::temporary());
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_mailbox_twice() {
        let h = harness().await;
        let first = ensure_mailbox(h.mailboxes.as_ref(), "alice@example.com", "UNPAID")
            .await
            .unwrap();
        let second = ensure_mailbox(h.mailboxes.as_ref(), "alice@example.com", "UNPAID")
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
