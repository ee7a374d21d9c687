//! Contract between the rotation engine and a PKI issuing authority.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sidecar_types::{Result, RotationError, Serial};
use std::time::Duration;

use crate::keypair::{parse_certificates, Keypair, TrustPool};

/// Identity to request a certificate for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub ttl: Duration,
}

impl IssueRequest {
    pub fn new(common_name: impl Into<String>, alt_names: Vec<String>, ttl: Duration) -> Self {
        Self {
            common_name: common_name.into(),
            alt_names,
            ttl,
        }
    }
}

/// Everything one successful issuance produces.
#[derive(Debug, Clone)]
pub struct IssuedBundle {
    pub keypair: Keypair,
    pub trust_pool: TrustPool,
    pub serial: Serial,
}

impl IssuedBundle {
    /// Assemble a bundle from the PEM fields of an issue response.
    ///
    /// The keypair and trust pool are derived from the same `chain_pem`, so
    /// they can never disagree about the issuer.
    pub fn from_pem(
        certificate_pem: &str,
        private_key_pem: &str,
        chain_pem: &str,
        serial: Serial,
    ) -> Result<Self> {
        let chain = parse_certificates(chain_pem).map_err(|e| {
            RotationError::InstallInvariantViolation(format!("Failed to parse CA chain: {}", e))
        })?;
        let trust_pool = TrustPool::from_der(chain.clone())?;
        let keypair = Keypair::from_pem(certificate_pem, private_key_pem, chain, serial.clone())?;

        Ok(Self {
            keypair,
            trust_pool,
            serial,
        })
    }
}

/// A PKI issuing authority.
///
/// Implementations are expected to be called by a single rotation task at a
/// time; they do not need to serialise calls themselves.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issue a fresh certificate for `request`.
    ///
    /// Fails with `Issuance` on transport failure, authority rejection or an
    /// incomplete response, and with `InstallInvariantViolation` when the
    /// response cannot be turned into a usable keypair and trust pool.
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle>;

    /// Revoke a previously issued certificate, returning the revocation time.
    async fn revoke(&self, serial: &Serial) -> Result<DateTime<Utc>>;

    /// Best-effort cleanup of the authority's certificate and revocation stores.
    async fn tidy(&self) -> Result<()>;
}
