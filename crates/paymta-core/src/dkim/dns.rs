//! DNS records to publish for a signing domain

use super::{DkimError, SigningKey};

/// Maximum length of one character-string in a TXT record
const TXT_CHUNK: usize = 255;

/// One record suggestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub label: &'static str,
    pub name: String,
    pub kind: &'static str,
    pub value: String,
}

impl std::fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t{}\t{}", self.name, self.kind, self.value)
    }
}

/// `v=DKIM1` TXT value for the key
pub fn dkim_txt_record(key: &SigningKey) -> Result<String, DkimError> {
    Ok(format!(
        "v=DKIM1; k={}; p={};",
        key.algorithm().key_type(),
        key.public_key_base64()?
    ))
}

/// Split a TXT value into quoted 255-character strings
pub fn split_txt(value: &str) -> String {
    value
        .as_bytes()
        .chunks(TXT_CHUNK)
        .map(|chunk| format!("\"{}\"", String::from_utf8_lossy(chunk)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// DKIM, DMARC and SPF records for `domain`
pub fn dns_records(
    domain: &str,
    selector: &str,
    key: &SigningKey,
) -> Result<Vec<DnsRecord>, DkimError> {
    Ok(vec![
        DnsRecord {
            label: "DKIM",
            name: format!("{}._domainkey.{}.", selector, domain),
            kind: "TXT",
            value: split_txt(&dkim_txt_record(key)?),
        },
        DnsRecord {
            label: "DMARC",
            name: format!("_dmarc.{}.", domain),
            kind: "TXT",
            value: split_txt(&format!(
                "v=DMARC1; p=reject; pct=100; rua=mailto:abuse@{d}; ruf=mailto:abuse@{d}; aspf=r; adkim=r; sp=none;",
                d = domain
            )),
        },
        DnsRecord {
            label: "SPF",
            name: format!("{}.", domain),
            kind: "TXT",
            value: split_txt("v=spf1 a mx -all"),
        },
    ])
}
