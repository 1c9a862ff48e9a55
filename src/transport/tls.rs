// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! TLS setup for the binary API socket
//!
//! Routers in the field overwhelmingly run self-signed certificates, so the
//! connector supports an explicit CA bundle or (opt-in) accepting any
//! certificate.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Certificate trust configuration for socket TLS.
#[derive(Debug, Clone, Default)]
pub enum TlsOptions {
    /// No TLS; plain API port.
    #[default]
    Disabled,
    /// TLS verified against a PEM CA bundle.
    CaBundle(Vec<u8>),
    /// TLS accepting any certificate (self-signed routers).
    AcceptInvalid,
}

impl TlsOptions {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Build a connector for the configured trust mode.
///
/// Fails with [`Error::Tls`] on an unloadable CA bundle and with
/// [`Error::Config`] when called with TLS disabled.
pub(super) fn build_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match options {
        TlsOptions::Disabled => {
            return Err(Error::Config(
                "TLS connector requested with TLS disabled".to_string(),
            ))
        }
        TlsOptions::CaBundle(pem) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs_from_pem(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("failed to add CA cert: {e}")))?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        TlsOptions::AcceptInvalid => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve a host string into a rustls server name.
pub(super) fn server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        Ok(ServerName::IpAddress(ip.into()))
    } else {
        ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {host:?}: {e}")))
    }
}

fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) =
        rustls_pemfile::read_one(&mut cursor)
    {
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in CA bundle".to_string()));
    }

    Ok(certs)
}

/// Verifier that accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: rustls::crypto::CryptoProvider,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
