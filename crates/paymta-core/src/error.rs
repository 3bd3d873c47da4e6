//! Error types for routing and delivery

use crate::dkim::DkimError;
use thiserror::Error;

/// An SMTP reply that ends a transaction, relayed to the client as is
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `451 4.3.0 Temporary error`, for failures the client must not see
    pub fn temporary() -> Self {
        Self::new(451, "4.3.0 Temporary error")
    }

    /// Whether the reply is a positive completion (2xx)
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Failure delivering to one remote recipient
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid recipient address {0:?}")]
    InvalidAddress(String),

    #[error("no mail exchangers for {0}")]
    NoMailExchangers(String),

    #[error("MX lookup for {domain} failed: {reason}")]
    Resolve { domain: String, reason: String },

    #[error("could not connect to any mail exchanger for {domain}: {}", attempts.join("; "))]
    AllCandidatesFailed {
        domain: String,
        attempts: Vec<String>,
    },

    #[error("SMTP transaction with {host} failed: {source}")]
    Transaction {
        host: String,
        #[source]
        source: lettre::transport::smtp::Error,
    },

    #[error("delivery timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("signing failed: {0}")]
    Signing(#[from] DkimError),
}

/// Outcome of one recipient of a routed message
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    /// Held for payment under the given quarantine id
    Quarantined(String),
    Rejected(Rejection),
    Failed(anyhow::Error),
}

impl DeliveryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DeliveryOutcome::Rejected(_) | DeliveryOutcome::Failed(_))
    }

    /// The reply the SMTP client sees for this outcome when it is a failure
    pub fn to_rejection(&self) -> Option<Rejection> {
        match self {
            DeliveryOutcome::Rejected(r) => Some(r.clone()),
            DeliveryOutcome::Failed(_) => Some(Rejection::temporary()),
            _ => None,
        }
    }
}
