//! SMTP server: listeners and the per-connection session

mod auth;
mod handler;
mod server;
mod tls;

pub use auth::{AuthResult, SmtpAuthenticator};
pub use handler::{SessionContext, SmtpHandler};
pub use server::{ListenerSet, RunningListeners};
pub use tls::create_tls_acceptor;
