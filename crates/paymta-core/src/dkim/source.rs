//! Where signers come from

use super::{DkimError, DkimSigner, DkimSigningConfig};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Supplies the signer for each outbound message
#[async_trait]
pub trait SignerSource: Send + Sync {
    async fn signer(&self) -> Result<Arc<DkimSigner>, DkimError>;
}

/// Reads the key file on every call, so a rotated key is picked up
/// without a restart
pub struct FileSignerSource {
    path: PathBuf,
    config: DkimSigningConfig,
}

impl FileSignerSource {
    pub fn new(path: impl Into<PathBuf>, config: DkimSigningConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

#[async_trait]
impl SignerSource for FileSignerSource {
    async fn signer(&self) -> Result<Arc<DkimSigner>, DkimError> {
        let pem = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DkimError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        let signer = DkimSigner::from_pem(self.config.clone(), &pem)?;
        debug!(path = %self.path.display(), algorithm = signer.key().algorithm().tag(), "Loaded DKIM key");
        Ok(Arc::new(signer))
    }
}

/// A fixed signer
pub struct StaticSignerSource(Arc<DkimSigner>);

impl StaticSignerSource {
    pub fn new(signer: DkimSigner) -> Self {
        Self(Arc::new(signer))
    }
}

#[async_trait]
impl SignerSource for StaticSignerSource {
    async fn signer(&self) -> Result<Arc<DkimSigner>, DkimError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::SigningAlgorithm;
    use ed25519_dalek::pkcs8::EncodePrivateKey;

    #[tokio::test]
    async fn test_file_source_rereads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dkim.pem");
        let source = FileSignerSource::new(&path, DkimSigningConfig::new("example.com", "mail"));

        assert!(matches!(source.signer().await, Err(DkimError::Io { .. })));

        let key = ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]);
        let pem = key.to_pkcs8_pem(Default::default()).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let signer = source.signer().await.unwrap();
        assert_eq!(signer.key().algorithm(), SigningAlgorithm::Ed25519Sha256);

        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(source.signer().await, Err(DkimError::Key(_))));
    }
}
