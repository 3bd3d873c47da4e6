//! Credential store

use crate::db::{map_db_error, DatabasePool};
use crate::models::{Account, Credential};
use crate::password::{hash_secret, verify_secret};
use async_trait::async_trait;
use paymta_common::types::local_part;
use paymta_common::{Error, Result};
use uuid::Uuid;

/// Identities served by this host and the application keys they log in with
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether `email` is a local account
    async fn exists(&self, email: &str) -> Result<bool>;

    /// Check a login and key; returns the canonical address on success
    async fn authenticate(&self, username: &str, password: &str) -> Result<String>;

    /// Resolve a login name to its canonical address
    async fn lookup_by_login(&self, login: &str) -> Result<Option<String>>;

    /// Store a new application key for `email`, creating the account if needed
    async fn add_credential(&self, email: &str, secret: &str) -> Result<()>;
}

pub(crate) fn normalize(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// PostgreSQL credential store
pub struct DbCredentialStore {
    pool: DatabasePool,
}

impl DbCredentialStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn account(&self, email: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE email = $1")
            .bind(email)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn credentials(&self, email: &str) -> Result<Vec<Credential>> {
        sqlx::query_as::<_, Credential>(
            "SELECT * FROM credentials WHERE email = $1 ORDER BY created_at DESC",
        )
        .bind(email)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl CredentialStore for DbCredentialStore {
    async fn exists(&self, email: &str) -> Result<bool> {
        Ok(self.account(&normalize(email)).await?.is_some())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let email = match self.lookup_by_login(username).await? {
            Some(email) => email,
            None => normalize(username),
        };

        let matched = self
            .credentials(&email)
            .await?
            .iter()
            .any(|c| verify_secret(password, &c.key_hash));

        if matched {
            Ok(email)
        } else {
            Err(Error::Auth("Invalid credentials".to_string()))
        }
    }

    async fn lookup_by_login(&self, login: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT email FROM accounts WHERE login = $1")
            .bind(normalize(login))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn add_credential(&self, email: &str, secret: &str) -> Result<()> {
        let email = normalize(email);
        let key_hash = hash_secret(secret)?;

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO accounts (email, login, created_at)
            VALUES ($1, $2, now())
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&email)
        .bind(local_part(&email))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_error(e, &email))?;

        sqlx::query(
            "INSERT INTO credentials (id, email, key_hash, created_at) VALUES ($1, $2, $3, now())",
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&key_hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
