//! TLS settings shared by the DoT and DoH transports
//!
//! The trust store is Mozilla's roots via `webpki-roots`, extended with
//! any PEM bundles named under `ca.path` in the configuration. Each
//! upstream derives its own `ClientConfig` from the shared store;
//! `insecure_skip_verify` swaps in a verifier that accepts anything,
//! for tests and experts only.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::info;

use crate::error::{DnsError, DnsResult};

/// Shared trust anchors for every TLS upstream
#[derive(Debug)]
pub struct TlsSettings {
    roots: RootCertStore,
}

impl TlsSettings {
    /// Build the store from webpki roots plus the given PEM bundles
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when a bundle cannot be read or
    /// contains no usable certificate.
    pub fn load<P: AsRef<Path>>(ca_paths: &[P]) -> DnsResult<Self> {
        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for path in ca_paths {
            let path = path.as_ref();
            let pem = std::fs::read(path).map_err(|e| {
                DnsError::config(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;

            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| {
                    DnsError::config(format!("bad certificate in {}: {e}", path.display()))
                })?;
                roots.add(cert).map_err(|e| {
                    DnsError::config(format!("unusable certificate in {}: {e}", path.display()))
                })?;
                added += 1;
            }
            if added == 0 {
                return Err(DnsError::config(format!(
                    "no certificate parsed from {}",
                    path.display()
                )));
            }
            info!(path = %path.display(), certs = added, "CA bundle loaded");
        }

        Ok(Self { roots })
    }

    /// A client config backed by the shared store
    ///
    /// With `insecure` set, certificate verification is disabled
    /// entirely.
    #[must_use]
    pub fn client_config(&self, insecure: bool) -> ClientConfig {
        if insecure {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        }
    }

    /// Parse a TLS server name for SNI
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the name is neither a hostname
    /// nor an IP address.
    pub fn server_name(name: &str) -> DnsResult<ServerName<'static>> {
        ServerName::try_from(name.to_string())
            .map_err(|_| DnsError::config(format!("invalid TLS server name '{name}'")))
    }
}

/// Accepts any certificate; installed by `insecure_skip_verify`
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
