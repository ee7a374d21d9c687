//! Certificate rotation for mutual TLS.
//!
//! - [`state`]: the current keypair, trust pool and serial as one snapshot
//! - [`engine`]: issue, install, then retire the displaced certificate
//! - [`scheduler`]: jittered periodic refresh with an initial rotation
//! - [`hooks`]: rustls callbacks that read the state on every handshake

pub mod engine;
pub mod hooks;
pub mod scheduler;
pub mod state;

pub use engine::{RefreshOutcome, Retirement, RotationEngine};
pub use hooks::{
    ClientCertHook, RotatingClientVerifier, RotatingServerVerifier, ServerCertHook, TlsHooks,
};
pub use scheduler::{RefreshPolicy, RefreshScheduler};
pub use state::{RotationSnapshot, RotationState};
