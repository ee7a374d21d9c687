//! PKI authority client for the TLS sidecar.
//!
//! Issues short-lived certificates, revokes the ones they replace and asks the
//! authority to tidy its stores. [`CertificateAuthority`] is the seam the
//! rotation engine depends on; [`VaultPkiClient`] implements it against a
//! HashiCorp Vault PKI mount.

mod authority;
mod keypair;
mod vault;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use authority::{CertificateAuthority, IssueRequest, IssuedBundle};
pub use keypair::{crypto_provider, parse_certificates, parse_private_key, Keypair, TrustPool};
pub use vault::{VaultPkiClient, VaultSettings};
