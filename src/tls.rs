//! Shared TLS helpers
//!
//! The Coordinator and the peer-to-peer receiver both present a
//! server identity loaded from a PEM file (certificate chain plus
//! PKCS#8 key). Clients skip certificate verification entirely:
//! default deployments use a self-signed certificate.

use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Build a TLS acceptor from a PEM file containing the certificate
/// chain and the private key.
pub fn acceptor_from_pem(path: &Path) -> Result<TlsAcceptor> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("Cannot read {}: {e}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Invalid certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificate in {}", path.display())));
    }
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| Error::Tls(format!("Invalid key in {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("No private key in {}", path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector that accepts all certificates.
///
/// Deployments use self-signed certificates with hostname
/// verification disabled, so we skip verification entirely.
#[must_use]
pub fn insecure_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS connection to `host:port` with verification disabled.
pub async fn connect(host: &str, port: u16) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp_stream = TcpStream::connect((host, port)).await?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;
    insecure_connector()
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))
}

/// Certificate verifier that accepts whatever identity the peer
/// presents. Both the Coordinator and the peer-to-peer listener ship
/// with self-signed certificates, so the client treats TLS as
/// encryption-only and the one-time transfer token does the
/// authorizing.
#[derive(Debug)]
struct DangerousVerifier;

impl ServerCertVerifier for DangerousVerifier {
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
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        // Whatever the installed ring provider can verify; skipping
        // verification must not narrow the handshake.
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
