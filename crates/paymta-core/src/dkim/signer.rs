//! DKIM signer

use super::canon::{canonicalize_body, canonicalize_header, split_message, Canonicalization, RawHeader};
use super::DkimError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use paymta_common::types::Envelope;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// DKIM signing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    RsaSha256,
    Ed25519Sha256,
}

impl SigningAlgorithm {
    /// Value of the `a=` tag
    pub fn tag(self) -> &'static str {
        match self {
            SigningAlgorithm::RsaSha256 => "rsa-sha256",
            SigningAlgorithm::Ed25519Sha256 => "ed25519-sha256",
        }
    }

    /// Value of the `k=` tag in the DNS record
    pub fn key_type(self) -> &'static str {
        match self {
            SigningAlgorithm::RsaSha256 => "rsa",
            SigningAlgorithm::Ed25519Sha256 => "ed25519",
        }
    }
}

/// Private key material, RSA or Ed25519
pub enum SigningKey {
    Rsa {
        signing: rsa::pkcs1v15::SigningKey<Sha256>,
        public: RsaPublicKey,
    },
    Ed25519(ed25519_dalek::SigningKey),
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({})", self.algorithm().tag())
    }
}

impl SigningKey {
    pub fn rsa(key: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&key);
        Self::Rsa {
            signing: rsa::pkcs1v15::SigningKey::<Sha256>::new(key),
            public,
        }
    }

    pub fn ed25519(key: ed25519_dalek::SigningKey) -> Self {
        Self::Ed25519(key)
    }

    /// Parse a PEM private key; the key type is detected
    pub fn from_pem(pem: &str) -> Result<Self, DkimError> {
        if let Ok(key) = <RsaPrivateKey as rsa::pkcs8::DecodePrivateKey>::from_pkcs8_pem(pem) {
            return Ok(Self::rsa(key));
        }
        if let Ok(key) = <RsaPrivateKey as rsa::pkcs1::DecodeRsaPrivateKey>::from_pkcs1_pem(pem) {
            return Ok(Self::rsa(key));
        }
        <ed25519_dalek::SigningKey as ed25519_dalek::pkcs8::DecodePrivateKey>::from_pkcs8_pem(pem)
            .map(Self::Ed25519)
            .map_err(|e| DkimError::Key(e.to_string()))
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        match self {
            SigningKey::Rsa { .. } => SigningAlgorithm::RsaSha256,
            SigningKey::Ed25519(_) => SigningAlgorithm::Ed25519Sha256,
        }
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            SigningKey::Rsa { signing, .. } => {
                use rsa::signature::SignatureEncoding;
                rsa::signature::Signer::sign(signing, data).to_vec()
            }
            // RFC 8463 signs the SHA-256 digest of the header data
            SigningKey::Ed25519(key) => {
                let digest = Sha256::digest(data);
                ed25519_dalek::Signer::sign(key, &digest).to_bytes().to_vec()
            }
        }
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self {
            SigningKey::Rsa { public, .. } => {
                let verifying = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public.clone());
                rsa::pkcs1v15::Signature::try_from(signature)
                    .map(|sig| rsa::signature::Verifier::verify(&verifying, data, &sig).is_ok())
                    .unwrap_or(false)
            }
            SigningKey::Ed25519(key) => {
                let digest = Sha256::digest(data);
                ed25519_dalek::Signature::from_slice(signature)
                    .map(|sig| {
                        ed25519_dalek::Verifier::verify(&key.verifying_key(), &digest, &sig).is_ok()
                    })
                    .unwrap_or(false)
            }
        }
    }

    /// Base64 public key for the `p=` tag: SubjectPublicKeyInfo DER for
    /// RSA, the raw 32-byte key for Ed25519
    pub fn public_key_base64(&self) -> Result<String, DkimError> {
        match self {
            SigningKey::Rsa { public, .. } => {
                let der = rsa::pkcs8::EncodePublicKey::to_public_key_der(public)
                    .map_err(|e| DkimError::Key(e.to_string()))?;
                Ok(BASE64.encode(der.as_bytes()))
            }
            SigningKey::Ed25519(key) => Ok(BASE64.encode(key.verifying_key().as_bytes())),
        }
    }
}

/// DKIM signing configuration
#[derive(Debug, Clone)]
pub struct DkimSigningConfig {
    /// Domain name (d= tag)
    pub domain: String,
    /// Selector (s= tag)
    pub selector: String,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    /// Headers to sign, when present
    pub headers_to_sign: Vec<String>,
}

impl DkimSigningConfig {
    pub fn new(domain: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            ..Self::default()
        }
    }
}

impl Default for DkimSigningConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            selector: String::new(),
            header_canon: Canonicalization::Relaxed,
            body_canon: Canonicalization::Relaxed,
            headers_to_sign: [
                "from",
                "to",
                "cc",
                "subject",
                "date",
                "message-id",
                "reply-to",
                "in-reply-to",
                "references",
                "mime-version",
                "content-type",
                "received",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
        }
    }
}

/// DKIM signer for outgoing mail
#[derive(Debug)]
pub struct DkimSigner {
    config: DkimSigningConfig,
    key: SigningKey,
}

impl DkimSigner {
    pub fn new(config: DkimSigningConfig, key: SigningKey) -> Self {
        Self { config, key }
    }

    /// Create a signer from a PEM private key
    pub fn from_pem(config: DkimSigningConfig, pem: &str) -> Result<Self, DkimError> {
        Ok(Self::new(config, SigningKey::from_pem(pem)?))
    }

    pub fn config(&self) -> &DkimSigningConfig {
        &self.config
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Compute the `DKIM-Signature` header line, CRLF terminated
    pub fn signature_header(&self, message: &[u8]) -> Result<String, DkimError> {
        let (headers, body) = split_message(message)
            .ok_or_else(|| DkimError::Malformed("no header fields".to_string()))?;

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body(
            self.config.body_canon,
            body,
        )));

        let signed: Vec<&RawHeader> = self
            .config
            .headers_to_sign
            .iter()
            .filter_map(|name| last_header(&headers, name))
            .collect();
        let names: Vec<String> = signed.iter().map(|h| h.name.trim().to_ascii_lowercase()).collect();

        let value = format!(
            " v=1; a={}; c={}/{}; d={}; s={}; t={}; h={}; bh={}; b=",
            self.key.algorithm().tag(),
            self.config.header_canon.name(),
            self.config.body_canon.name(),
            self.config.domain,
            self.config.selector,
            chrono::Utc::now().timestamp(),
            names.join(":"),
            body_hash
        );

        let data = signing_input(self.config.header_canon, &signed, "DKIM-Signature", &value);
        let signature = BASE64.encode(self.key.sign(data.as_bytes()));

        Ok(format!("DKIM-Signature:{}{}\r\n", value, signature))
    }

    /// Sign the envelope data and prefix the signature header
    pub fn sign(&self, envelope: &mut Envelope) -> Result<(), DkimError> {
        let header = self.signature_header(&envelope.data)?;
        envelope.prefix_line(header.as_bytes());
        Ok(())
    }

    /// Check a message whose first header is a signature made with this key
    pub fn verify(&self, signed: &[u8]) -> Result<(), DkimError> {
        let (headers, _) = split_message(signed)
            .ok_or_else(|| DkimError::Malformed("no header fields".to_string()))?;
        let first = headers
            .first()
            .filter(|h| h.name.trim().eq_ignore_ascii_case("DKIM-Signature"))
            .ok_or_else(|| DkimError::Verify("first header is not DKIM-Signature".to_string()))?;

        let tags = parse_tags(&first.value.replace("\r\n", ""));
        let tag = |name: &str| {
            tags.get(name)
                .map(String::as_str)
                .ok_or_else(|| DkimError::Verify(format!("missing {}= tag", name)))
        };

        let (header_canon, body_canon) = Canonicalization::parse_pair(tag("c").unwrap_or("simple"));
        let rest = strip_first_header(signed);
        let (headers, body) = split_message(rest)
            .ok_or_else(|| DkimError::Malformed("no header fields".to_string()))?;

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body(body_canon, body)));
        if body_hash != tag("bh")? {
            return Err(DkimError::Verify("body hash mismatch".to_string()));
        }

        let signed_headers: Vec<&RawHeader> = tag("h")?
            .split(':')
            .filter_map(|name| last_header(&headers, name.trim()))
            .collect();
        let unsigned_value = strip_b_value(&first.value)
            .ok_or_else(|| DkimError::Verify("missing b= tag".to_string()))?;
        let data = signing_input(header_canon, &signed_headers, &first.name, &unsigned_value);

        let signature: String = tag("b")?.chars().filter(|c| !c.is_whitespace()).collect();
        let signature = BASE64
            .decode(signature)
            .map_err(|e| DkimError::Verify(format!("b= is not base64: {}", e)))?;

        if self.key.verify(data.as_bytes(), &signature) {
            Ok(())
        } else {
            Err(DkimError::Verify("signature mismatch".to_string()))
        }
    }
}

/// Header data the signature covers: the signed headers, then the
/// signature header itself without its final CRLF
fn signing_input(
    canon: Canonicalization,
    signed: &[&RawHeader],
    signature_name: &str,
    signature_value: &str,
) -> String {
    let mut data = String::new();
    for header in signed {
        data.push_str(&canonicalize_header(canon, header));
    }
    let signature_header = RawHeader {
        name: signature_name.to_string(),
        value: signature_value.to_string(),
    };
    let canonical = canonicalize_header(canon, &signature_header);
    data.push_str(canonical.trim_end_matches("\r\n"));
    data
}

/// The bottom-most instance of a header, as RFC 6376 5.4.2 picks it
fn last_header<'a>(headers: &'a [RawHeader], name: &str) -> Option<&'a RawHeader> {
    headers
        .iter()
        .rev()
        .find(|h| h.name.trim().eq_ignore_ascii_case(name))
}

fn parse_tags(s: &str) -> HashMap<String, String> {
    s.split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

/// Empty the b= tag, keeping everything else byte for byte
fn strip_b_value(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let mut search_from = 0usize;

    while let Some(rel_idx) = lower[search_from..].find("b=") {
        let idx = search_from + rel_idx;
        let tag_start = lower[..idx]
            .rsplit(';')
            .next()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true);

        if tag_start {
            let value_start = idx + 2;
            let value_end = value[value_start..]
                .find(';')
                .map(|end| value_start + end)
                .unwrap_or(value.len());

            let mut result = String::with_capacity(value.len());
            result.push_str(&value[..value_start]);
            result.push_str(&value[value_end..]);
            return Some(result);
        }

        search_from = idx + 2;
    }

    None
}

/// Bytes after the first (possibly folded) header field
fn strip_first_header(message: &[u8]) -> &[u8] {
    let mut pos = 0;
    while let Some(nl) = message[pos..].iter().position(|&b| b == b'\n') {
        pos += nl + 1;
        match message.get(pos) {
            Some(b' ') | Some(b'\t') => continue,
            _ => return &message[pos..],
        }
    }
    &message[message.len()..]
}
