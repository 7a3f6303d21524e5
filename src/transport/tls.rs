//! Client TLS configuration.
//!
//! Builds the rustls client config used by the TLS-upgrade state: webpki
//! roots by default, with optional extra roots from a PEM file for private
//! deployments.

use std::fs;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;

use crate::config::TlsConfig;
use crate::error::{Result, WireError};

/// Build the rustls client configuration from the `[tls]` config section.
pub fn client_tls_config(config: &TlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(ca_file) = &config.ca_file {
        let pem = fs::read(ca_file).map_err(|e| {
            WireError::Config(format!("Failed to read CA file {ca_file:?}: {e}"))
        })?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| WireError::Config(format!("Failed to parse CA PEM: {e}")))?;
        if certs.is_empty() {
            return Err(WireError::Config(
                "No certificates found in CA PEM file".to_string(),
            ));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| WireError::Config(format!("Invalid CA certificate: {e}")))?;
        }
    }

    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(client))
}
