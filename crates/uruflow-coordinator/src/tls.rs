//! TLS listener setup
//!
//! Certificates come from PEM files, or from a generated self-signed
//! certificate when `auto_cert` is enabled (intended for deployments whose
//! workers set `tls_skip_verify`).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use uruflow_core::config::TlsConfig;

/// TLS configuration failures
#[derive(Error, Debug)]
pub enum TlsSetupError {
    #[error("tls enabled but cert_file/key_file missing and auto_cert disabled")]
    MissingCertificate,

    #[error("no private key found in {0}")]
    MissingKey(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the listener-side acceptor, or `None` when TLS is disabled
pub fn server_acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>, TlsSetupError> {
    if !config.enabled {
        return Ok(None);
    }

    let server_config = if config.auto_cert {
        tracing::info!("using auto-generated self-signed certificate");
        self_signed_config()?
    } else {
        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => file_config(cert, key)?,
            _ => return Err(TlsSetupError::MissingCertificate),
        }
    };

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn self_signed_config() -> Result<rustls::ServerConfig, TlsSetupError> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key.into())?;
    Ok(config)
}

fn file_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig, TlsSetupError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
            .collect::<Result<_, _>>()?;

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
            .ok_or_else(|| TlsSetupError::MissingKey(key_file.display().to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tls_yields_no_acceptor() {
        let acceptor = server_acceptor(&TlsConfig::default()).unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn test_auto_cert_builds_acceptor() {
        let config = TlsConfig {
            enabled: true,
            auto_cert: true,
            ..Default::default()
        };
        let acceptor = server_acceptor(&config).unwrap();
        assert!(acceptor.is_some());
    }

    #[test]
    fn test_enabled_without_files_or_auto_cert_fails() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            server_acceptor(&config),
            Err(TlsSetupError::MissingCertificate)
        ));
    }
}
