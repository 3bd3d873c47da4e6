//! In-memory backends for the `memory` database setting and for tests

use crate::credentials::{normalize, CredentialStore};
use crate::models::QuarantineRecord;
use crate::password::{hash_secret, verify_secret};
use crate::quarantine::QuarantineStore;
use async_trait::async_trait;
use paymta_common::config::AccountConfig;
use paymta_common::types::local_part;
use paymta_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Accounts {
    /// address -> key hashes
    keys: HashMap<String, Vec<String>>,
    /// login -> address
    logins: HashMap<String, String>,
}

/// Credential store kept in process memory
#[derive(Default)]
pub struct MemoryCredentialStore {
    accounts: RwLock<Accounts>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configured accounts; the store starts empty otherwise
    pub async fn seed(&self, accounts: &[AccountConfig]) -> Result<()> {
        for account in accounts {
            self.add_credential(&account.email, &account.key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn exists(&self, email: &str) -> Result<bool> {
        Ok(self.accounts.read().await.keys.contains_key(&normalize(email)))
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let accounts = self.accounts.read().await;
        let login = normalize(username);
        let email = accounts.logins.get(&login).cloned().unwrap_or(login);

        let matched = accounts
            .keys
            .get(&email)
            .is_some_and(|hashes| hashes.iter().any(|h| verify_secret(password, h)));

        if matched {
            Ok(email)
        } else {
            Err(Error::Auth("Invalid credentials".to_string()))
        }
    }

    async fn lookup_by_login(&self, login: &str) -> Result<Option<String>> {
        Ok(self.accounts.read().await.logins.get(&normalize(login)).cloned())
    }

    async fn add_credential(&self, email: &str, secret: &str) -> Result<()> {
        let email = normalize(email);
        let hash = hash_secret(secret)?;

        let mut accounts = self.accounts.write().await;
        accounts
            .logins
            .entry(local_part(&email).to_string())
            .or_insert_with(|| email.clone());
        accounts.keys.entry(email).or_default().push(hash);
        Ok(())
    }
}

/// Quarantine store kept in process memory
#[derive(Default)]
pub struct MemoryQuarantineStore {
    records: RwLock<HashMap<(String, String), QuarantineRecord>>,
}

impl MemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of held records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Ids held for `recipient`, sorted
    pub async fn ids(&self, recipient: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .await
            .keys()
            .filter(|(r, _)| r == recipient)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl QuarantineStore for MemoryQuarantineStore {
    async fn put(&self, recipient: &str, id: &str, record: &QuarantineRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let key = (recipient.to_string(), id.to_string());
        if records.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("Quarantine record {}", id)));
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, recipient: &str, id: &str) -> Result<Option<QuarantineRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(recipient.to_string(), id.to_string()))
            .cloned())
    }
}
