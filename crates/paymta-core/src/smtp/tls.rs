//! Server-side TLS for the STARTTLS and implicit TLS listeners

use paymta_common::config::TlsConfig;
use paymta_common::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Config(format!("Failed to open {} {}: {}", what, path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path, "certificate file")?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path, "key file")?)
        .map_err(|e| Error::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Config(format!("No private key found in {}", path.display())))
}

/// Build the acceptor shared by every TLS-capable listener
pub fn create_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert_path)?;
    info!(count = certs.len(), path = %tls.cert_path.display(), "Loaded TLS certificates");
    let key = load_key(&tls.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("Invalid TLS certificate or key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_files() {
        let tls = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(create_tls_acceptor(&tls), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_certificate_file() {
        let mut cert = NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        let tls = TlsConfig {
            cert_path: cert.path().to_path_buf(),
            key_path: cert.path().to_path_buf(),
        };
        let err = create_tls_acceptor(&tls).err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }
}
