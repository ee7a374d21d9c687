//! Rotation engine: issue, install, then retire the displaced certificate.
//!
//! Network calls to the authority happen strictly outside the state swap.
//! Once a new issuance is installed it is authoritative; revocation and tidy
//! of the displaced serial are follow-up steps whose failures are reported
//! but never unwind the install.

use chrono::{DateTime, Utc};
use sidecar_pki::{CertificateAuthority, IssueRequest};
use sidecar_types::{Result, RotationError, RotationEvent, Serial};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::state::RotationState;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What happened to the displaced serial after an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retirement {
    Revoked {
        serial: Serial,
        revoked_at: DateTime<Utc>,
        tidy_error: Option<RotationError>,
    },
    /// The serial stays unrevoked until the authority's own expiry reclaims it.
    RevocationFailed { serial: Serial, error: RotationError },
}

/// Result of a successful refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub serial: Serial,
    pub previous: Option<Serial>,
    pub not_after: DateTime<Utc>,
    pub retirement: Option<Retirement>,
}

pub struct RotationEngine {
    authority: Arc<dyn CertificateAuthority>,
    request: IssueRequest,
    state: Arc<RotationState>,
    events: broadcast::Sender<RotationEvent>,
    // One refresh at a time, whoever triggers it.
    refresh_lock: Mutex<()>,
}

impl RotationEngine {
    pub fn new(authority: Arc<dyn CertificateAuthority>, request: IssueRequest) -> Self {
        Self::with_state(authority, request, Arc::new(RotationState::new()))
    }

    pub fn with_state(
        authority: Arc<dyn CertificateAuthority>,
        request: IssueRequest,
        state: Arc<RotationState>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            authority,
            request,
            state,
            events,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<RotationState> {
        &self.state
    }

    pub fn request(&self) -> &IssueRequest {
        &self.request
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    /// The mandatory first rotation. Any failure is fatal to startup.
    pub async fn initialize(&self) -> Result<RefreshOutcome> {
        self.refresh().await.map_err(|e| {
            error!("Initial certificate issuance for {} failed: {}", self.request.common_name, e);
            RotationError::Initialization(Box::new(e))
        })
    }

    /// Run one rotation cycle.
    ///
    /// # Errors
    /// `Issuance` or `InstallInvariantViolation` when no new certificate was
    /// installed; the current one stays in service. Revocation and tidy
    /// failures are not errors here, they surface in [`RefreshOutcome::retirement`].
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.state.current_serial();

        let bundle = match self.authority.issue(&self.request).await {
            Ok(bundle) => bundle,
            Err(e) => return Err(self.refresh_failed(e)),
        };

        let serial = bundle.serial.clone();
        let not_after = bundle.keypair.not_after();
        if current.as_ref() == Some(&serial) {
            return Err(self.refresh_failed(RotationError::InstallInvariantViolation(format!(
                "Authority returned the serial already in service: {}",
                serial
            ))));
        }

        let previous = match self.state.install_bundle(bundle) {
            Ok(previous) => previous,
            Err(e) => return Err(self.refresh_failed(e)),
        };

        info!(
            "Refreshed certificate for {}. New serial: {} (expires {})",
            self.request.common_name, serial, not_after
        );
        self.publish(RotationEvent::Refreshed {
            serial: serial.clone(),
            previous: previous.clone(),
            not_after,
        });

        let retirement = match &previous {
            Some(displaced) => Some(self.retire(displaced).await),
            None => None,
        };

        Ok(RefreshOutcome {
            serial,
            previous,
            not_after,
            retirement,
        })
    }

    /// Revoke the displaced serial, then tidy. Never retried here.
    async fn retire(&self, serial: &Serial) -> Retirement {
        let revoked_at = match self.authority.revoke(serial).await {
            Ok(revoked_at) => revoked_at,
            Err(e) => {
                let error = match e {
                    RotationError::Revocation { .. } => e,
                    other => RotationError::Revocation {
                        serial: serial.clone(),
                        reason: other.to_string(),
                    },
                };
                error!("Couldn't revoke previous certificate: {}", error);
                self.publish(RotationEvent::RevocationFailed {
                    serial: serial.clone(),
                    reason: error.to_string(),
                });
                return Retirement::RevocationFailed {
                    serial: serial.clone(),
                    error,
                };
            }
        };

        info!("Old certificate {} revoked at {}", serial, revoked_at);
        self.publish(RotationEvent::Revoked {
            serial: serial.clone(),
            revoked_at,
        });

        let tidy_error = match self.authority.tidy().await {
            Ok(()) => None,
            Err(e) => {
                let error = match e {
                    RotationError::Tidy(_) => e,
                    other => RotationError::Tidy(other.to_string()),
                };
                warn!("Authority tidy failed: {}", error);
                self.publish(RotationEvent::TidyFailed {
                    reason: error.to_string(),
                });
                Some(error)
            }
        };

        Retirement::Revoked {
            serial: serial.clone(),
            revoked_at,
            tidy_error,
        }
    }

    fn refresh_failed(&self, error: RotationError) -> RotationError {
        match self.state.current_serial() {
            Some(serial) => error!(
                "Error while refreshing certs: {}. Serial {} stays in service",
                error, serial
            ),
            None => error!("Error while refreshing certs: {}", error),
        }
        self.publish(RotationEvent::RefreshFailed {
            reason: error.to_string(),
        });
        error
    }

    fn publish(&self, event: RotationEvent) {
        // No subscribers is not a failure.
        let _ = self.events.send(event);
    }
}
