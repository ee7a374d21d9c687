//! Handshake-time callbacks that always consult the current rotation state.
//!
//! A TLS config built from [`TlsHooks`] never captures a certificate or a
//! trust pool. Every handshake asks the state, so connections opened after a
//! rotation use the new issuance while established ones keep what they
//! negotiated.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig,
    SignatureScheme,
};
use sidecar_pki::crypto_provider;
use sidecar_types::{Result, RotationError};
use std::sync::Arc;
use tracing::warn;

use crate::state::{RotationSnapshot, RotationState};

fn no_certificate() -> TlsError {
    TlsError::General("No certificate has been installed yet".to_string())
}

fn current_key(state: &RotationState) -> Option<Arc<CertifiedKey>> {
    state
        .read()
        .map(|snapshot| Arc::clone(snapshot.keypair().certified_key()))
}

fn current_snapshot(state: &RotationState) -> std::result::Result<Arc<RotationSnapshot>, TlsError> {
    state.read().ok_or_else(no_certificate)
}

/// Factory for the hooks and TLS configs bound to one [`RotationState`].
#[derive(Debug, Clone)]
pub struct TlsHooks {
    state: Arc<RotationState>,
    provider: Arc<CryptoProvider>,
}

impl TlsHooks {
    pub fn new(state: Arc<RotationState>) -> Self {
        Self {
            state,
            provider: crypto_provider(),
        }
    }

    pub fn state(&self) -> &Arc<RotationState> {
        &self.state
    }

    pub fn server_cert_resolver(&self) -> Arc<ServerCertHook> {
        Arc::new(ServerCertHook {
            state: Arc::clone(&self.state),
        })
    }

    pub fn client_cert_resolver(&self) -> Arc<ClientCertHook> {
        Arc::new(ClientCertHook {
            state: Arc::clone(&self.state),
        })
    }

    pub fn client_verifier(&self) -> Arc<RotatingClientVerifier> {
        Arc::new(RotatingClientVerifier {
            state: Arc::clone(&self.state),
            provider: Arc::clone(&self.provider),
        })
    }

    pub fn server_verifier(&self) -> Arc<RotatingServerVerifier> {
        Arc::new(RotatingServerVerifier {
            state: Arc::clone(&self.state),
            provider: Arc::clone(&self.provider),
        })
    }

    /// Server side of mutual TLS: present the current keypair and require a
    /// client certificate issued by the current trust pool.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| RotationError::Config(format!("TLS protocol versions: {}", e)))?
            .with_client_cert_verifier(self.client_verifier())
            .with_cert_resolver(self.server_cert_resolver());

        Ok(config)
    }

    /// Client side of mutual TLS: present the current keypair and verify the
    /// server against the current trust pool.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| RotationError::Config(format!("TLS protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(self.server_verifier())
            .with_client_cert_resolver(self.client_cert_resolver());

        Ok(config)
    }
}

/// Presents the current keypair as the server certificate.
#[derive(Debug)]
pub struct ServerCertHook {
    state: Arc<RotationState>,
}

impl ResolvesServerCert for ServerCertHook {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = current_key(&self.state);
        if key.is_none() {
            warn!("Inbound handshake before any certificate was installed");
        }
        key
    }
}

/// Presents the current keypair as the client certificate.
///
/// The acceptable-issuer hints sent by the server are ignored; the one
/// current keypair is always offered.
#[derive(Debug)]
pub struct ClientCertHook {
    state: Arc<RotationState>,
}

impl ResolvesClientCert for ClientCertHook {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let key = current_key(&self.state);
        if key.is_none() {
            warn!("Outbound handshake before any certificate was installed");
        }
        key
    }

    fn has_certs(&self) -> bool {
        self.state.read().is_some()
    }
}

/// Verifies client certificates against the trust pool current at handshake time.
#[derive(Debug)]
pub struct RotatingClientVerifier {
    state: Arc<RotationState>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for RotatingClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, TlsError> {
        let snapshot = current_snapshot(&self.state)?;
        snapshot
            .trust_pool()
            .client_verifier()
            .verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies server certificates against the trust pool current at handshake time.
#[derive(Debug)]
pub struct RotatingServerVerifier {
    state: Arc<RotationState>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RotatingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let snapshot = current_snapshot(&self.state)?;
        snapshot.trust_pool().server_verifier().verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
