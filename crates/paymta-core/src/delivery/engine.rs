//! SMTP client side of outbound delivery

use super::{MxCandidate, MxResolver, Relay};
use crate::error::DeliveryError;
use async_trait::async_trait;
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use paymta_common::config::{Config, PortConfig, TlsMode};
use paymta_common::types::{EmailAddress, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivers to the MX hosts of the recipient domain, trying every
/// (host, port) pair in order until one accepts a connection
pub struct SmtpDeliveryEngine {
    resolver: Arc<dyn MxResolver>,
    ports: Vec<PortConfig>,
    hello: ClientId,
    connect_timeout: Duration,
    timeout: Duration,
}

impl SmtpDeliveryEngine {
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        ports: Vec<PortConfig>,
        hello_name: &str,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            ports,
            hello: ClientId::Domain(hello_name.to_string()),
            connect_timeout,
            timeout,
        }
    }

    pub fn from_config(resolver: Arc<dyn MxResolver>, config: &Config) -> Self {
        Self::new(
            resolver,
            config.delivery.ports.clone(),
            config.hello_name(),
            config.delivery.connect_timeout(),
            config.delivery.timeout(),
        )
    }

    /// Connect and finish the TLS handshake the port calls for
    async fn connect(
        &self,
        host: &str,
        port: PortConfig,
    ) -> Result<AsyncSmtpConnection, lettre::transport::smtp::Error> {
        let implicit = match port.tls {
            TlsMode::Implicit => Some(TlsParameters::new(host.to_string())?),
            _ => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (host, port.port),
            Some(self.connect_timeout),
            &self.hello,
            implicit,
            None,
        )
        .await?;

        if port.tls == TlsMode::Opportunistic && conn.can_starttls() {
            conn.starttls(TlsParameters::new(host.to_string())?, &self.hello)
                .await?;
        }

        Ok(conn)
    }

    /// First connection that succeeds across all hosts and ports
    async fn establish(
        &self,
        domain: &str,
        candidates: &[MxCandidate],
    ) -> Result<(String, AsyncSmtpConnection), DeliveryError> {
        let mut attempts = Vec::new();

        for candidate in candidates {
            for &port in &self.ports {
                debug!(mx = %candidate.host, port = port.port, tls = %port.tls, "Connecting");
                match self.connect(&candidate.host, port).await {
                    Ok(conn) => {
                        debug!(mx = %candidate.host, port = port.port, "Connected");
                        return Ok((candidate.host.clone(), conn));
                    }
                    Err(e) => {
                        warn!(
                            mx = %candidate.host,
                            port = port.port,
                            error = %e,
                            "Connection failed, trying next candidate"
                        );
                        attempts.push(format!("{}:{} ({}): {}", candidate.host, port.port, port.tls, e));
                    }
                }
            }
        }

        Err(DeliveryError::AllCandidatesFailed {
            domain: domain.to_string(),
            attempts,
        })
    }

    async fn deliver_once(&self, envelope: &Envelope, recipient: &str) -> Result<(), DeliveryError> {
        let address = EmailAddress::parse(recipient)
            .ok_or_else(|| DeliveryError::InvalidAddress(recipient.to_string()))?;
        let smtp_envelope = smtp_envelope(envelope, recipient)?;

        let mut candidates = self.resolver.lookup_mx(&address.domain).await?;
        if candidates.is_empty() {
            return Err(DeliveryError::NoMailExchangers(address.domain));
        }
        candidates.sort_by_key(|c| c.preference);

        let (host, mut conn) = self.establish(&address.domain, &candidates).await?;

        let transaction = |source| DeliveryError::Transaction {
            host: host.clone(),
            source,
        };
        conn.send(&smtp_envelope, &envelope.data)
            .await
            .map_err(transaction)?;
        conn.quit().await.map_err(transaction)?;

        info!(to = %recipient, mx = %host, size = envelope.data.len(), "Delivered");
        Ok(())
    }
}

fn smtp_envelope(
    envelope: &Envelope,
    recipient: &str,
) -> Result<lettre::address::Envelope, DeliveryError> {
    let from = if envelope.has_null_sender() {
        None
    } else {
        Some(
            envelope
                .sender
                .parse::<lettre::Address>()
                .map_err(|_| DeliveryError::InvalidAddress(envelope.sender.clone()))?,
        )
    };
    let to = recipient
        .parse::<lettre::Address>()
        .map_err(|_| DeliveryError::InvalidAddress(recipient.to_string()))?;

    lettre::address::Envelope::new(from, vec![to])
        .map_err(|_| DeliveryError::InvalidAddress(recipient.to_string()))
}

#[async_trait]
impl Relay for SmtpDeliveryEngine {
    async fn deliver(&self, envelope: &Envelope, recipient: &str) -> Result<(), DeliveryError> {
        tokio::time::timeout(self.timeout, self.deliver_once(envelope, recipient))
            .await
            .map_err(|_| DeliveryError::Timeout(self.timeout))?
    }
}
