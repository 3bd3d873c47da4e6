//! DKIM signing (RFC 6376, RFC 8463)

mod canon;
mod dns;
mod signer;
mod source;

pub use canon::Canonicalization;
pub use dns::{dkim_txt_record, dns_records, split_txt, DnsRecord};
pub use signer::{DkimSigner, DkimSigningConfig, SigningAlgorithm, SigningKey};
pub use source::{FileSignerSource, SignerSource, StaticSignerSource};

use thiserror::Error;

/// DKIM failures
#[derive(Debug, Error)]
pub enum DkimError {
    #[error("failed to read key {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported or malformed private key: {0}")]
    Key(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("signature does not verify: {0}")]
    Verify(String),
}
