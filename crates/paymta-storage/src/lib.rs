//! paymta storage - credential, mailbox and quarantine stores
//!
//! Every collaborator sits behind a narrow async trait with a PostgreSQL or
//! file-backed implementation and an in-memory one used for local runs and tests.

pub mod credentials;
pub mod db;
pub mod logging;
pub mod mailbox;
pub mod memory;
pub mod models;
pub mod password;
pub mod quarantine;

pub use credentials::{CredentialStore, DbCredentialStore};
pub use db::DatabasePool;
pub use logging::{LoggingCredentialStore, LoggingMailboxStore};
pub use mailbox::{FileMailboxStore, MailboxInfo, MailboxStore, MessageFlag, SpecialUse};
pub use memory::{MemoryCredentialStore, MemoryQuarantineStore};
pub use models::QuarantineRecord;
pub use quarantine::{DbQuarantineStore, QuarantineStore};
