//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Account row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub login: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Application key row
#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub email: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Unpaid message held until the sender pays
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Reverse path of the held message
    pub sender: String,
    /// When the message was received
    pub date: DateTime<Utc>,
    /// Subject header, empty when absent
    pub subject: String,
    /// Raw message when it is valid UTF-8
    pub data: Option<String>,
}

impl QuarantineRecord {
    /// Build a record from raw message bytes
    pub fn new(
        sender: impl Into<String>,
        date: DateTime<Utc>,
        subject: impl Into<String>,
        raw: &[u8],
    ) -> Self {
        Self {
            sender: sender.into(),
            date,
            subject: subject.into(),
            data: std::str::from_utf8(raw).ok().map(str::to_string),
        }
    }
}
