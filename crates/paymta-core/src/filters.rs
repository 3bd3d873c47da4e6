//! Connection, sender and recipient allow-lists

use crate::error::Rejection;
use ipnet::IpNet;
use paymta_common::config::SmtpConfig;
use paymta_common::{Error, Result};
use regex::Regex;
use std::net::IpAddr;

/// Whether `address` matches one of `patterns`.
///
/// An empty list allows everything. `@domain` matches any address whose
/// part after the last `@` equals `domain`; anything else must equal the
/// whole address. Comparison ignores ASCII case.
pub fn allowed(address: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }

    let address = address.trim();
    let domain = address.rsplit_once('@').map(|(_, d)| d);

    patterns.iter().any(|pattern| match pattern.strip_prefix('@') {
        Some(wanted) => domain.is_some_and(|d| d.eq_ignore_ascii_case(wanted)),
        None => address.eq_ignore_ascii_case(pattern),
    })
}

/// Allow-lists compiled once from the SMTP configuration
#[derive(Debug, Clone, Default)]
pub struct Policy {
    nets: Vec<IpNet>,
    sender_regex: Option<Regex>,
    recipient_regex: Option<Regex>,
    sender_patterns: Vec<String>,
    recipient_patterns: Vec<String>,
}

impl Policy {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let nets = config
            .allowed_nets
            .iter()
            .map(|n| {
                n.parse::<IpNet>()
                    .map_err(|e| Error::Config(format!("Invalid network {:?}: {}", n, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let compile = |pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| Error::Config(format!("Invalid regular expression: {}", e)))
        };

        Ok(Self {
            nets,
            sender_regex: compile(&config.allowed_sender)?,
            recipient_regex: compile(&config.allowed_recipients)?,
            sender_patterns: config.allowed_sender_addresses.clone().unwrap_or_default(),
            recipient_patterns: config.allowed_recipient_addresses.clone().unwrap_or_default(),
        })
    }

    /// Connection check; an empty network list admits every peer
    pub fn check_connection(&self, ip: IpAddr) -> std::result::Result<(), Rejection> {
        if self.nets.is_empty() || self.nets.iter().any(|n| n.contains(&ip)) {
            Ok(())
        } else {
            Err(Rejection::new(421, "4.7.0 Denied"))
        }
    }

    pub fn check_sender(&self, address: &str) -> std::result::Result<(), Rejection> {
        if !allowed(address, &self.sender_patterns) {
            return Err(Rejection::new(451, "4.7.1 Sender address not allowed"));
        }
        match &self.sender_regex {
            Some(re) if !re.is_match(address) => {
                Err(Rejection::new(451, "4.1.8 Invalid sender domain"))
            }
            _ => Ok(()),
        }
    }

    pub fn check_recipient(&self, address: &str) -> std::result::Result<(), Rejection> {
        if !allowed(address, &self.recipient_patterns) {
            return Err(Rejection::new(451, "4.7.1 Recipient address not allowed"));
        }
        match &self.recipient_regex {
            Some(re) if !re.is_match(address) => {
                Err(Rejection::new(451, "4.1.1 Invalid recipient address"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_list_allows_everything() {
        assert!(allowed("anyone@anywhere.org", &[]));
        assert!(allowed("", &[]));
    }

    #[test]
    fn test_exact_match_is_reflexive() {
        for address in ["alice@example.com", "postmaster", "x@y"] {
            assert!(allowed(address, &patterns(&[address])));
        }
        assert!(allowed("Alice@Example.com", &patterns(&["alice@example.com"])));
        assert!(!allowed("bob@example.com", &patterns(&["alice@example.com"])));
    }

    #[test]
    fn test_domain_pattern() {
        let p = patterns(&["@example.com"]);
        assert!(allowed("alice@example.com", &p));
        assert!(allowed("bob@EXAMPLE.com", &p));
        assert!(!allowed("alice@sub.example.com", &p));
        assert!(!allowed("alice@notexample.com", &p));
        assert!(!allowed("example.com", &p));
    }

    #[test]
    fn test_bare_local_part_is_whole_address() {
        let p = patterns(&["alice"]);
        assert!(allowed("alice", &p));
        assert!(!allowed("alice@example.com", &p));
    }

    #[test]
    fn test_policy_regex_and_nets() {
        let config = SmtpConfig {
            allowed_nets: vec!["10.0.0.0/8".into()],
            allowed_sender: Some(r"@example\.com$".into()),
            allowed_recipient_addresses: Some(vec!["@example.com".into()]),
            ..SmtpConfig::default()
        };
        let policy = Policy::from_config(&config).unwrap();

        assert!(policy.check_connection("10.1.2.3".parse().unwrap()).is_ok());
        assert_eq!(
            policy.check_connection("192.0.2.1".parse().unwrap()).unwrap_err().code,
            421
        );

        assert!(policy.check_sender("alice@example.com").is_ok());
        assert_eq!(policy.check_sender("eve@evil.org").unwrap_err().code, 451);

        assert!(policy.check_recipient("bob@example.com").is_ok());
        assert_eq!(policy.check_recipient("bob@other.org").unwrap_err().code, 451);
    }

    #[test]
    fn test_default_policy_allows_all() {
        let policy = Policy::from_config(&SmtpConfig::default()).unwrap();
        assert!(policy.check_connection("203.0.113.9".parse().unwrap()).is_ok());
        assert!(policy.check_sender("").is_ok());
        assert!(policy.check_recipient("someone@somewhere").is_ok());
    }
}
