//! Logging decorators around the collaborator stores

use crate::credentials::CredentialStore;
use crate::mailbox::{MailboxInfo, MailboxStore, MessageFlag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paymta_common::Result;
use tracing::{debug, warn};

/// Logs every mailbox store call and its outcome
pub struct LoggingMailboxStore<S> {
    inner: S,
}

impl<S: MailboxStore> LoggingMailboxStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn log_result<T>(op: &str, user: &str, mailbox: &str, result: &Result<T>) {
    match result {
        Ok(_) => debug!(op, user, mailbox, "Mailbox operation succeeded"),
        Err(e) => warn!(op, user, mailbox, error = %e, "Mailbox operation failed"),
    }
}

#[async_trait]
impl<S: MailboxStore> MailboxStore for LoggingMailboxStore<S> {
    async fn create_mailbox(&self, user: &str, name: &str) -> Result<MailboxInfo> {
        let result = self.inner.create_mailbox(user, name).await;
        log_result("create_mailbox", user, name, &result);
        result
    }

    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>> {
        let result = self.inner.get_mailbox(user, name).await;
        log_result("get_mailbox", user, name, &result);
        result
    }

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<MailboxInfo>> {
        let result = self.inner.list_mailboxes(user).await;
        log_result("list_mailboxes", user, "*", &result);
        result
    }

    async fn delete_mailbox(&self, user: &str, name: &str) -> Result<()> {
        let result = self.inner.delete_mailbox(user, name).await;
        log_result("delete_mailbox", user, name, &result);
        result
    }

    async fn rename_mailbox(&self, user: &str, from: &str, to: &str) -> Result<()> {
        let result = self.inner.rename_mailbox(user, from, to).await;
        log_result("rename_mailbox", user, from, &result);
        result
    }

    async fn create_message(
        &self,
        mailbox: &MailboxInfo,
        flags: &[MessageFlag],
        date: DateTime<Utc>,
        literal: &[u8],
    ) -> Result<u32> {
        let result = self.inner.create_message(mailbox, flags, date, literal).await;
        match &result {
            Ok(uid) => debug!(
                user = %mailbox.user,
                mailbox = %mailbox.name,
                uid,
                size = literal.len(),
                "Message created"
            ),
            Err(e) => warn!(
                user = %mailbox.user,
                mailbox = %mailbox.name,
                error = %e,
                "Message creation failed"
            ),
        }
        result
    }
}

/// Logs credential lookups; secrets never reach the log
pub struct LoggingCredentialStore<S> {
    inner: S,
}

impl<S: CredentialStore> LoggingCredentialStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: CredentialStore> CredentialStore for LoggingCredentialStore<S> {
    async fn exists(&self, email: &str) -> Result<bool> {
        let result = self.inner.exists(email).await;
        debug!(email, result = ?result.as_ref().ok(), "Credential exists lookup");
        result
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let result = self.inner.authenticate(username, password).await;
        match &result {
            Ok(email) => debug!(username, email = %email, "Authentication succeeded"),
            Err(e) => warn!(username, error = %e, "Authentication failed"),
        }
        result
    }

    async fn lookup_by_login(&self, login: &str) -> Result<Option<String>> {
        let result = self.inner.lookup_by_login(login).await;
        debug!(login, result = ?result.as_ref().ok(), "Login lookup");
        result
    }

    async fn add_credential(&self, email: &str, secret: &str) -> Result<()> {
        let result = self.inner.add_credential(email, secret).await;
        match &result {
            Ok(()) => debug!(email, "Credential added"),
            Err(e) => warn!(email, error = %e, "Adding credential failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::FileMailboxStore;
    use crate::memory::MemoryCredentialStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_decorators_forward_calls() {
        let dir = TempDir::new().unwrap();
        let store = LoggingMailboxStore::new(FileMailboxStore::new(dir.path()).unwrap());
        let inbox = store.create_mailbox("alice@example.com", "INBOX").await.unwrap();
        let uid = store
            .create_message(&inbox, &[], Utc::now(), b"hello")
            .await
            .unwrap();
        assert_eq!(store.inner().read_message(&inbox, uid).await.unwrap(), b"hello");
        assert!(store.rename_mailbox("alice@example.com", "INBOX", "X").await.is_err());

        let creds = LoggingCredentialStore::new(MemoryCredentialStore::new());
        creds.add_credential("alice@example.com", "key").await.unwrap();
        assert!(creds.exists("alice@example.com").await.unwrap());
        assert!(creds.authenticate("alice", "key").await.is_ok());
    }
}
