//! TLS policy for outbound upstream connections
//!
//! The relay does not terminate TLS itself. The only TLS it speaks is as a
//! client, when the upstream peer connects to a `wss://` hub.

use anyhow::{Context, Result};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use std::sync::Arc;
use tokio_tungstenite::Connector;
use tracing::warn;

/// Substrings of handshake errors caused by certificate verification
const TLS_VERIFY_ERRORS: [&str; 7] = [
    "unknownissuer",
    "unknown issuer",
    "self signed",
    "self-signed",
    "expired",
    "notvalidyet",
    "invalidcertificate",
];

/// Install the ring provider as the process default. Safe to call repeatedly.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Connector for the upstream socket.
///
/// `None` keeps tokio-tungstenite's default (webpki roots, full
/// verification). With `reject_unauthorized == false` every server
/// certificate is accepted.
pub fn upstream_connector(reject_unauthorized: bool) -> Result<Option<Connector>> {
    ensure_crypto_provider();
    if reject_unauthorized {
        return Ok(None);
    }

    warn!("Upstream TLS certificate verification is disabled");
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();

    Ok(Some(Connector::Rustls(Arc::new(config))))
}

/// True when a connect error looks like a certificate verification failure
pub fn is_tls_verify_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    TLS_VERIFY_ERRORS.iter().any(|fragment| lower.contains(fragment))
}

/// Certificate verifier used when `AIRPAD_UPSTREAM_REJECT_UNAUTHORIZED=false`
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verified_connector_uses_defaults() {
        assert!(upstream_connector(true).unwrap().is_none());
    }

    #[test]
    fn test_insecure_connector_builds() {
        assert!(matches!(upstream_connector(false).unwrap(), Some(Connector::Rustls(_))));
    }

    #[test]
    fn test_tls_error_detection() {
        assert!(is_tls_verify_error("invalid peer certificate: UnknownIssuer"));
        assert!(is_tls_verify_error("certificate has Expired"));
        assert!(!is_tls_verify_error("Connection refused (os error 111)"));
    }
}
