//! Quarantine store

use crate::db::{map_db_error, DatabasePool};
use crate::models::QuarantineRecord;
use async_trait::async_trait;
use paymta_common::{Error, Result};

/// Holding area for unpaid inbound mail, keyed by recipient and id
#[async_trait]
pub trait QuarantineStore: Send + Sync {
    /// Store a record; an id already taken for `recipient` is `AlreadyExists`
    async fn put(&self, recipient: &str, id: &str, record: &QuarantineRecord) -> Result<()>;

    async fn get(&self, recipient: &str, id: &str) -> Result<Option<QuarantineRecord>>;
}

/// PostgreSQL quarantine store
pub struct DbQuarantineStore {
    pool: DatabasePool,
}

impl DbQuarantineStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuarantineStore for DbQuarantineStore {
    async fn put(&self, recipient: &str, id: &str, record: &QuarantineRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quarantine (recipient, id, sender, date, subject, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            "#,
        )
        .bind(recipient)
        .bind(id)
        .bind(&record.sender)
        .bind(record.date)
        .bind(&record.subject)
        .bind(&record.data)
        .execute(self.pool.pool())
        .await
        .map_err(|e| map_db_error(e, &format!("Quarantine record {}", id)))?;
        Ok(())
    }

    async fn get(&self, recipient: &str, id: &str) -> Result<Option<QuarantineRecord>> {
        sqlx::query_as::<_, QuarantineRecord>(
            "SELECT sender, date, subject, data FROM quarantine WHERE recipient = $1 AND id = $2",
        )
        .bind(recipient)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
