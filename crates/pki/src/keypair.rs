//! Certificate material delivered by the authority.
//!
//! A [`Keypair`] is the leaf certificate, its private key and the issuer chain
//! as one immutable unit. A [`TrustPool`] is the CA set derived from that same
//! chain, together with the webpki verifiers built from it.

use chrono::{DateTime, Utc};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use sidecar_types::{Result, RotationError, Serial};
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::*;

/// The crypto provider used for signing keys and peer verification.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM blob.
pub fn parse_certificates(pem: &str) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes()).collect()
}

/// Parse the first private key in a PEM blob.
///
/// Accepts PKCS8, PKCS1 (RSA) and SEC1 (EC) encodings.
pub fn parse_private_key(pem: &str) -> std::io::Result<Option<PrivateKeyDer<'static>>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
}

/// Certificate, private key and issuer chain of one issuance.
#[derive(Clone)]
pub struct Keypair {
    certified_key: Arc<CertifiedKey>,
    issuer_chain: Vec<CertificateDer<'static>>,
    serial: Serial,
    common_name: Option<String>,
    not_after: DateTime<Utc>,
}

impl Keypair {
    /// Build a keypair from the PEM fields of an issue response.
    ///
    /// # Errors
    /// `Issuance` when the certificate or key field holds nothing usable,
    /// `InstallInvariantViolation` when the material parses but cannot become
    /// a signing identity.
    pub fn from_pem(
        certificate_pem: &str,
        private_key_pem: &str,
        issuer_chain: Vec<CertificateDer<'static>>,
        serial: Serial,
    ) -> Result<Self> {
        let leaf_certs = parse_certificates(certificate_pem).map_err(|e| {
            RotationError::Issuance(format!("Failed to parse certificate PEM: {}", e))
        })?;
        let leaf = leaf_certs.first().cloned().ok_or_else(|| {
            RotationError::Issuance("Certificate field contains no PEM certificate".to_string())
        })?;

        let key = parse_private_key(private_key_pem)
            .map_err(|e| {
                RotationError::Issuance(format!("Failed to parse private key PEM: {}", e))
            })?
            .ok_or_else(|| {
                RotationError::Issuance("Private key field contains no PEM key".to_string())
            })?;

        let (common_name, not_after) = inspect_leaf(&leaf)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
            RotationError::InstallInvariantViolation(format!("Unsupported private key: {}", e))
        })?;

        let mut chain = leaf_certs;
        chain.extend(issuer_chain.iter().cloned());

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            issuer_chain,
            serial,
            common_name,
            not_after,
        })
    }

    /// The identity handed to rustls during a handshake.
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        // CertifiedKey is always built with the leaf first.
        &self.certified_key.cert[0]
    }

    pub fn issuer_chain(&self) -> &[CertificateDer<'static>] {
        &self.issuer_chain
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// True if the certificate expires within `window` from now (or already has).
    pub fn expires_within(&self, window: std::time::Duration) -> bool {
        match (self.not_after - Utc::now()).to_std() {
            Ok(remaining) => remaining <= window,
            Err(_) => true,
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("serial", &self.serial)
            .field("common_name", &self.common_name)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.certified_key.cert.len())
            .finish()
    }
}

fn inspect_leaf(leaf: &CertificateDer<'_>) -> Result<(Option<String>, DateTime<Utc>)> {
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
        RotationError::InstallInvariantViolation(format!("Failed to parse certificate: {}", e))
    })?;

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let not_after = DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        .ok_or_else(|| {
            RotationError::InstallInvariantViolation(
                "Certificate expiry is out of range".to_string(),
            )
        })?;

    Ok((common_name, not_after))
}

/// CA certificates of the current issuance, usable as roots for both
/// directions of mutual TLS.
#[derive(Clone)]
pub struct TrustPool {
    certificates: Vec<CertificateDer<'static>>,
    client_verifier: Arc<dyn ClientCertVerifier>,
    server_verifier: Arc<WebPkiServerVerifier>,
}

impl TrustPool {
    /// Build a pool from a PEM chain.
    ///
    /// # Errors
    /// `InstallInvariantViolation` if the chain holds no certificate or any
    /// certificate cannot be used as a trust anchor.
    pub fn from_pem(chain_pem: &str) -> Result<Self> {
        let certificates = parse_certificates(chain_pem).map_err(|e| {
            RotationError::InstallInvariantViolation(format!("Failed to parse CA chain: {}", e))
        })?;
        Self::from_der(certificates)
    }

    pub fn from_der(certificates: Vec<CertificateDer<'static>>) -> Result<Self> {
        if certificates.is_empty() {
            return Err(RotationError::InstallInvariantViolation(
                "CA chain contains no certificates".to_string(),
            ));
        }

        let mut root_store = RootCertStore::empty();
        for cert in &certificates {
            root_store.add(cert.clone()).map_err(|e| {
                RotationError::InstallInvariantViolation(format!(
                    "Failed to add CA certificate to root store: {}",
                    e
                ))
            })?;
        }
        let roots = Arc::new(root_store);

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), crypto_provider())
                .build()
                .map_err(|e| {
                    RotationError::InstallInvariantViolation(format!(
                        "Failed to build client verifier: {}",
                        e
                    ))
                })?;

        let server_verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::clone(&roots), crypto_provider())
                .build()
                .map_err(|e| {
                    RotationError::InstallInvariantViolation(format!(
                        "Failed to build server verifier: {}",
                        e
                    ))
                })?;

        Ok(Self {
            certificates,
            client_verifier,
            server_verifier,
        })
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Verifier for client certificates presented to a server.
    pub fn client_verifier(&self) -> &Arc<dyn ClientCertVerifier> {
        &self.client_verifier
    }

    /// Verifier for server certificates presented to a client.
    pub fn server_verifier(&self) -> &Arc<WebPkiServerVerifier> {
        &self.server_verifier
    }
}

impl fmt::Debug for TrustPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustPool")
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCa;

    #[test]
    fn test_keypair_from_issued_pem() {
        let ca = TestCa::new("Test Root CA");
        let issued = ca.issue_pem("dumbserver", &["localhost"]);

        let chain = parse_certificates(&ca.certificate_pem()).unwrap();
        let keypair = Keypair::from_pem(
            &issued.certificate,
            &issued.private_key,
            chain,
            Serial::from("S1"),
        )
        .unwrap();

        assert_eq!(keypair.serial(), &Serial::from("S1"));
        assert_eq!(keypair.common_name(), Some("dumbserver"));
        // leaf + issuing CA
        assert_eq!(keypair.certified_key().cert.len(), 2);
        assert_eq!(keypair.issuer_chain().len(), 1);
        assert!(!keypair.expires_within(std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn test_keypair_rejects_missing_key() {
        let ca = TestCa::new("Test Root CA");
        let issued = ca.issue_pem("dumbserver", &[]);

        let err = Keypair::from_pem(&issued.certificate, "", vec![], Serial::from("S1"))
            .unwrap_err();
        assert!(matches!(err, RotationError::Issuance(_)));
    }

    #[test]
    fn test_keypair_rejects_missing_certificate() {
        let ca = TestCa::new("Test Root CA");
        let issued = ca.issue_pem("dumbserver", &[]);

        let err = Keypair::from_pem("not a pem", &issued.private_key, vec![], Serial::from("S1"))
            .unwrap_err();
        assert!(matches!(err, RotationError::Issuance(_)));
    }

    #[test]
    fn test_trust_pool_from_chain() {
        let ca = TestCa::new("Test Root CA");
        let pool = TrustPool::from_pem(&ca.certificate_pem()).unwrap();

        assert_eq!(pool.certificates().len(), 1);
    }

    #[test]
    fn test_trust_pool_rejects_empty_chain() {
        let err = TrustPool::from_pem("").unwrap_err();
        assert!(matches!(err, RotationError::InstallInvariantViolation(_)));
    }

    #[test]
    fn test_trust_pool_rejects_garbage_certificate() {
        let garbage = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let err = TrustPool::from_der(vec![garbage]).unwrap_err();
        assert!(matches!(err, RotationError::InstallInvariantViolation(_)));
    }
}
