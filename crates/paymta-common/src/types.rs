//! Common types for paymta

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Email address split at its last `@`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.trim().rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Whether the domain part equals `domain`, ignoring case and a trailing dot
    pub fn is_in_domain(&self, domain: &str) -> bool {
        self.domain
            .trim_end_matches('.')
            .eq_ignore_ascii_case(domain.trim_end_matches('.'))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation(format!("Invalid email address {s:?}")))
    }
}

/// Local part of an address, or the whole string when it has no `@`
pub fn local_part(address: &str) -> &str {
    match address.find('@') {
        Some(idx) if idx > 0 => &address[..idx],
        _ => address,
    }
}

/// The remote side of an SMTP session
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote socket address
    pub addr: SocketAddr,

    /// Name given in HELO/EHLO
    pub helo: String,

    /// Authenticated user; `None` for anonymous sessions
    pub username: Option<String>,

    /// Whether the session runs over TLS
    pub tls: bool,

    /// Whether the client greeted with EHLO
    pub extended: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            helo: String::new(),
            username: None,
            tls: false,
            extended: false,
        }
    }

    /// A non-empty username is the only signal for authenticated relay
    pub fn authenticated_user(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    /// Protocol keyword used in the trace line (RFC 3848)
    pub fn protocol(&self) -> &'static str {
        match (self.extended, self.tls, self.authenticated_user().is_some()) {
            (false, false, _) => "SMTP",
            (false, true, _) => "SMTPS",
            (true, false, false) => "ESMTP",
            (true, true, false) => "ESMTPS",
            (true, false, true) => "ESMTPA",
            (true, true, true) => "ESMTPSA",
        }
    }
}

/// Message envelope (SMTP level) plus the raw message
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Reverse path (MAIL FROM); empty for the null sender
    pub sender: String,

    /// Forward paths (RCPT TO), in the order they were given
    pub recipients: Vec<String>,

    /// Raw message source, headers and body
    pub data: Vec<u8>,

    /// Trace line prepended to `data`, once added
    pub received_line: Option<String>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            data,
            received_line: None,
        }
    }

    /// Insert `line` before the first byte of the message
    pub fn prefix_line(&mut self, line: &[u8]) {
        let mut data = Vec::with_capacity(line.len() + self.data.len());
        data.extend_from_slice(line);
        data.append(&mut self.data);
        self.data = data;
    }

    /// Prepend the `Received:` trace header. Calling it again is a no-op.
    pub fn add_received_line(&mut self, peer: &Peer, hostname: &str, now: DateTime<Local>) {
        if self.received_line.is_some() {
            return;
        }

        let helo: String = peer.helo.chars().filter(|c| !c.is_control()).collect();
        let helo = if helo.is_empty() { "unknown" } else { helo.as_str() };
        let line = format!(
            "Received: from {} ([{}]) by {} with {};\r\n\t{}\r\n",
            helo,
            peer.addr.ip(),
            hostname,
            peer.protocol(),
            now.to_rfc2822()
        );
        self.prefix_line(line.as_bytes());
        self.received_line = Some(line);
    }

    /// Whether the reverse path is the null sender `<>`
    pub fn has_null_sender(&self) -> bool {
        let s = self.sender.trim();
        s.is_empty() || s == "<>"
    }
}
