//! TLS client configuration: system roots, an optional extra CA bundle, or no verification at all.

use crate::error::{LdapError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::SignatureScheme;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use tracing::warn;

/// How the transport is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    None,
    /// TLS from the first byte (ldaps://).
    Ldaps,
    /// Plain TCP upgraded with the StartTLS extended operation right after connecting.
    StartTls,
}

/// Certificate verification settings for the client side of the handshake.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Accept any server certificate. Test networks only.
    pub skip_verify: bool,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
}

/// Verifier that accepts any server certificate. Only for use with skip_verify (internal/test).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the rustls client config for `options`.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    if options.skip_verify {
        return Ok(tls_client_config_insecure());
    }
    tls_client_config_with_ca(options.ca_pem.as_deref())
}

fn tls_client_config_insecure() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
        .with_no_client_auth();
    Arc::new(config)
}

fn tls_client_config_with_ca(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        // An explicit CA bundle is enough on its own.
        Err(e) if extra_ca_pem.is_some() => warn!("Failed to load system CA certs: {}", e),
        Err(e) => return Err(LdapError::Tls(format!("Load system CA certs: {}", e))),
    }
    if let Some(pem) = extra_ca_pem {
        let certs = parse_ca_pem(pem)?;
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| LdapError::Tls(format!("Add CA certificate: {}", e)))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn parse_ca_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| LdapError::Tls(format!("Parse CA PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(LdapError::Tls("No certificates in CA PEM data".to_string()));
    }
    Ok(certs)
}

/// SNI name for `host`; IP literals are accepted.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| LdapError::Tls(format!("Invalid hostname for TLS SNI: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config_builds() {
        let options = TlsOptions {
            skip_verify: true,
            ca_pem: None,
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_ca_pem_without_certificates_is_rejected() {
        let err = parse_ca_pem(b"not a certificate\n").unwrap_err();
        assert!(matches!(err, LdapError::Tls(_)));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("ldap.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}
