//! Per-message routing: outbound relay, local delivery, quarantine

mod bounce;
mod local;
mod router;

pub use bounce::{build_bounce, BounceNotice};
pub use local::{ensure_mailbox, AlwaysPaid, Entitlements, LocalDelivery, NeverPaid};
pub use router::{Direction, Reply, Routed, Router};
