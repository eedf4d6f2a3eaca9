//! TLS configuration for the remote transport (§4.11, §6).
//!
//! There is no public CA in this model: client and server are operated by
//! the same party and are expected to pin each other's certificate (by
//! distributing the server's DER bytes alongside the shared
//! `transport_key` used to derive the archive's own keys) rather than
//! validating a certificate chain. `generate_identity` always mints a
//! fresh keypair — deterministically regenerating the same private key
//! from `transport_key` would need a `KeyPair::from_der`-compatible seed
//! derivation `rcgen` does not expose, so pinning the server's public
//! certificate is the rollback/impersonation defense here, not key
//! determinism.

use std::sync::Arc;

use rcgen::{Certificate, CertificateParams, DistinguishedName};

use crate::error::{Error, Result};

pub struct TlsIdentity {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

pub fn generate_identity(common_name: &str) -> Result<TlsIdentity> {
    let mut params = CertificateParams::new(vec![common_name.to_string()]);
    params.distinguished_name = DistinguishedName::new();
    let cert = Certificate::from_params(params).map_err(|e| Error::Remote(e.to_string()))?;
    let cert_der = cert.serialize_der().map_err(|e| Error::Remote(e.to_string()))?;
    let key_der = cert.serialize_private_key_der();
    Ok(TlsIdentity { cert_der, key_der })
}

pub fn server_config(identity: &TlsIdentity) -> Result<Arc<rustls::ServerConfig>> {
    let cert = rustls::Certificate(identity.cert_der.clone());
    let key = rustls::PrivateKey(identity.key_der.clone());
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| Error::Remote(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Builds a client config that trusts exactly one certificate: the one the
/// caller pinned out of band. There is no client certificate, since the
/// server authenticates callers at the application layer (the archive
/// password), not at the transport layer.
pub fn client_config(pinned_cert_der: &[u8]) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(pinned_cert_der.to_vec()))
        .map_err(|e| Error::Remote(e.to_string()))?;
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_builds_a_server_config() {
        let identity = generate_identity("blockvault-remote").unwrap();
        server_config(&identity).unwrap();
    }

    #[test]
    fn pinned_certificate_builds_a_client_config() {
        let identity = generate_identity("blockvault-remote").unwrap();
        client_config(&identity.cert_der).unwrap();
    }
}
