//! Outbound delivery: MX resolution and the port fallback matrix

mod engine;
mod resolver;

pub use engine::SmtpDeliveryEngine;
pub use resolver::{DnsMxResolver, MxCandidate, MxResolver, StaticMxResolver};

use crate::error::DeliveryError;
use async_trait::async_trait;
use paymta_common::types::Envelope;

/// Hands a message to the mail exchanger of one remote recipient
#[async_trait]
pub trait Relay: Send + Sync {
    async fn deliver(&self, envelope: &Envelope, recipient: &str) -> Result<(), DeliveryError>;
}
