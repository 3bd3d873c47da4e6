//! paymta Common - Shared types and utilities
//!
//! Configuration, the shared error type and the envelope model used by
//! every paymta component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
