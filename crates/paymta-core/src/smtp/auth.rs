//! SMTP AUTH PLAIN and LOGIN

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use paymta_common::Error;
use paymta_storage::CredentialStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of an AUTH exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Canonical address of the authenticated user
    Success(String),
    Failure(&'static str),
    /// The credential store could not answer
    Unavailable,
}

impl AuthResult {
    /// SMTP reply for the result
    pub fn reply(&self) -> (u16, &'static str) {
        match self {
            AuthResult::Success(_) => (235, "2.7.0 Authentication successful"),
            AuthResult::Failure(_) => (535, "5.7.8 Authentication credentials invalid"),
            AuthResult::Unavailable => (454, "4.7.0 Temporary authentication failure"),
        }
    }
}

/// Checks SASL credentials against the credential store
#[derive(Clone)]
pub struct SmtpAuthenticator {
    credentials: Arc<dyn CredentialStore>,
}

impl SmtpAuthenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// PLAIN: base64(`[authzid] NUL authcid NUL password`)
    pub async fn authenticate_plain(&self, response: &str) -> AuthResult {
        let decoded = match BASE64.decode(response.trim()) {
            Ok(d) => d,
            Err(e) => {
                warn!("AUTH PLAIN: invalid base64: {}", e);
                return AuthResult::Failure("Invalid credentials encoding");
            }
        };

        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let (username, password) = match parts.as_slice() {
            [authcid, password] | [_, authcid, password] => (
                String::from_utf8_lossy(authcid).to_string(),
                String::from_utf8_lossy(password).to_string(),
            ),
            _ => {
                warn!("AUTH PLAIN: got {} fields", parts.len());
                return AuthResult::Failure("Invalid credential format");
            }
        };

        self.verify(&username, &password).await
    }

    /// LOGIN: username and password each sent base64 encoded
    pub async fn authenticate_login(&self, username: &str, password: &str) -> AuthResult {
        let decode = |field: &str| {
            BASE64
                .decode(field.trim())
                .map(|d| String::from_utf8_lossy(&d).to_string())
        };

        match (decode(username), decode(password)) {
            (Ok(username), Ok(password)) => self.verify(&username, &password).await,
            _ => {
                warn!("AUTH LOGIN: invalid base64");
                AuthResult::Failure("Invalid credentials encoding")
            }
        }
    }

    async fn verify(&self, username: &str, password: &str) -> AuthResult {
        if username.is_empty() {
            return AuthResult::Failure("Empty username");
        }

        match self.credentials.authenticate(username, password).await {
            Ok(email) => {
                debug!(user = %email, "AUTH succeeded");
                AuthResult::Success(email)
            }
            Err(Error::Auth(_)) => {
                debug!(user = username, "AUTH failed");
                AuthResult::Failure("Authentication failed")
            }
            Err(e) => {
                warn!(user = username, error = %e, "AUTH backend error");
                AuthResult::Unavailable
            }
        }
    }
}

pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}
