//! TLS material for the RPC listener and client.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::config::TlsConfig;
use crate::error::{CoordError, Result};

fn tls_error(what: &str, path: &Path, e: impl std::fmt::Display) -> CoordError {
    CoordError::Config(format!("{} {}: {}", what, path.display(), e))
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| tls_error("cannot open certificate", path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error("cannot parse certificate", path, e))?;
    if certs.is_empty() {
        return Err(tls_error("no certificates found in", path, "empty PEM"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| tls_error("cannot open private key", path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error("cannot parse private key", path, e))?
        .ok_or_else(|| tls_error("no private key found in", path, "empty PEM"))
}

/// Builds the listener config. A CA bundle turns on client certificate
/// verification (mTLS).
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) else {
        return Err(CoordError::Config(
            "TLS requires both cert_file and key_file".to_string(),
        ));
    };
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CoordError::Config(format!("TLS protocol setup failed: {}", e)))?;

    let builder = match &tls.ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error("invalid CA certificate", ca_file, e))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| CoordError::Config(format!("client verifier setup failed: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| CoordError::Config(format!("failed to build TLS config: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn missing_files_are_config_errors() {
        let tls = TlsConfig {
            cert_file: Some(PathBuf::from("/nonexistent/server.crt")),
            key_file: Some(PathBuf::from("/nonexistent/server.key")),
            ca_file: None,
        };
        let err = server_config(&tls).unwrap_err();
        assert!(matches!(err, CoordError::Config(ref m) if m.contains("server.crt")));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(load_certs(file.path()).is_err());
        assert!(load_private_key(file.path()).is_err());
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let tls = TlsConfig {
            cert_file: Some(PathBuf::from("/etc/pgcoord/server.crt")),
            ..TlsConfig::default()
        };
        assert!(server_config(&tls).is_err());
    }
}
