//! The single source of truth read by TLS handshakes.
//!
//! The current keypair, its trust pool and its serial live together in one
//! immutable [`RotationSnapshot`]. Readers clone an `Arc` to it; installing a
//! new issuance swaps that `Arc` under a write lock held for nothing but the
//! swap, so a reader sees either the whole old triple or the whole new one.

use sidecar_pki::{IssuedBundle, Keypair, TrustPool};
use sidecar_types::{Result, RotationError, Serial};
use std::fmt;
use std::sync::{Arc, RwLock};

/// One issuance: keypair, trust pool and serial, never mixed across issuances.
#[derive(Debug)]
pub struct RotationSnapshot {
    keypair: Keypair,
    trust_pool: TrustPool,
    serial: Serial,
}

impl RotationSnapshot {
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn trust_pool(&self) -> &TrustPool {
        &self.trust_pool
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }
}

#[derive(Default)]
pub struct RotationState {
    current: RwLock<Option<Arc<RotationSnapshot>>>,
}

impl RotationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current issuance, `None` until the first install.
    ///
    /// Never waits on anything but a pointer swap.
    pub fn read(&self) -> Option<Arc<RotationSnapshot>> {
        // A poisoned lock still guards a consistent Arc; the swap cannot panic halfway.
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    pub fn current_serial(&self) -> Option<Serial> {
        self.read().map(|snapshot| snapshot.serial.clone())
    }

    /// Replace the current issuance and return the serial it displaced.
    ///
    /// # Errors
    /// `InstallInvariantViolation` if the keypair was issued under a different
    /// serial or the serial is the one already installed. The state is left
    /// untouched in both cases.
    pub fn install(
        &self,
        keypair: Keypair,
        trust_pool: TrustPool,
        serial: Serial,
    ) -> Result<Option<Serial>> {
        if keypair.serial() != &serial {
            return Err(RotationError::InstallInvariantViolation(format!(
                "Keypair serial {} does not match install serial {}",
                keypair.serial(),
                serial
            )));
        }

        let next = Arc::new(RotationSnapshot {
            keypair,
            trust_pool,
            serial,
        });

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = guard.as_ref() {
            if current.serial == next.serial {
                return Err(RotationError::InstallInvariantViolation(format!(
                    "Serial {} is already installed",
                    next.serial
                )));
            }
        }
        let previous = guard.replace(next);
        drop(guard);

        Ok(previous.map(|snapshot| snapshot.serial.clone()))
    }

    pub fn install_bundle(&self, bundle: IssuedBundle) -> Result<Option<Serial>> {
        self.install(bundle.keypair, bundle.trust_pool, bundle.serial)
    }
}

impl fmt::Debug for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationState")
            .field("serial", &self.current_serial())
            .finish()
    }
}
