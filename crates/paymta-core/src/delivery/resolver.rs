//! MX lookup

use crate::error::DeliveryError;
use async_trait::async_trait;
use std::collections::HashMap;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// A mail exchanger for a domain; lower preference is tried first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCandidate {
    pub host: String,
    pub preference: u16,
}

impl MxCandidate {
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
        }
    }
}

/// Looks up the mail exchangers of a domain
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// An empty list means the domain has no MX records
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DeliveryError>;
}

/// MX lookup through the system DNS configuration
pub struct DnsMxResolver {
    resolver: TokioAsyncResolver,
}

impl DnsMxResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for DnsMxResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MxResolver for DnsMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DeliveryError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx) => Ok(mx
                .iter()
                .map(|r| {
                    MxCandidate::new(
                        r.exchange().to_string().trim_end_matches('.').to_string(),
                        r.preference(),
                    )
                })
                .collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DeliveryError::Resolve {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Fixed answers, keyed by lowercase domain
#[derive(Debug, Default, Clone)]
pub struct StaticMxResolver {
    records: HashMap<String, Vec<MxCandidate>>,
}

impl StaticMxResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, candidates: Vec<MxCandidate>) -> Self {
        self.records.insert(domain.to_ascii_lowercase(), candidates);
        self
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DeliveryError> {
        Ok(self
            .records
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}
