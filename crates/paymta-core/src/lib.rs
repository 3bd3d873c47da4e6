//! paymta core - SMTP ingest, routing and outbound delivery
//!
//! Mail arrives on the [`smtp`] listeners and is handed to the
//! [`routing::Router`] once per message. Authenticated users relay out
//! through [`delivery`] after [`dkim`] signing; mail for the served domain
//! is stored locally, and mail for recipients who have not been paid for
//! is quarantined and answered with a payment request.

pub mod delivery;
pub mod dkim;
pub mod error;
pub mod filters;
pub mod routing;
pub mod smtp;

pub use delivery::{DnsMxResolver, MxResolver, Relay, SmtpDeliveryEngine};
pub use dkim::{DkimSigner, FileSignerSource, SignerSource};
pub use error::{DeliveryError, DeliveryOutcome, Rejection};
pub use filters::Policy;
pub use routing::{Entitlements, Router};
pub use smtp::{ListenerSet, RunningListeners, SessionContext, SmtpAuthenticator};
