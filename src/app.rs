use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use sidecar_pki::{CertificateAuthority, VaultPkiClient};
use sidecar_rotation::{RefreshOutcome, RefreshScheduler, RotationEngine, TlsHooks};
use sidecar_types::Result;
use std::sync::Arc;
use tracing::info;

/// One rotating identity: the authority client, the engine driving it, the
/// scheduler and the TLS hooks reading the resulting state.
pub struct SidecarApp {
    common_name: String,
    authority: Arc<VaultPkiClient>,
    scheduler: RefreshScheduler,
    hooks: TlsHooks,
}

impl SidecarApp {
    pub fn new(config: &AppConfig, common_name: String) -> Result<Self> {
        config.validate()?;

        info!("Initializing TLS sidecar identity: {}", common_name);
        info!(
            "Certificate TTL: {}s, alt names: {:?}",
            config.identity.ttl_secs, config.identity.alt_names
        );

        let authority = Arc::new(VaultPkiClient::new(config.vault_settings(&common_name)?)?);
        let settings = authority.settings();
        info!(
            "Vault: {} (mount {}, role {})",
            settings.addr, settings.mount, settings.role
        );
        let engine = Arc::new(RotationEngine::new(
            authority.clone(),
            config.issue_request(&common_name),
        ));
        let hooks = TlsHooks::new(Arc::clone(engine.state()));
        let scheduler = RefreshScheduler::new(engine, config.refresh_policy()?);

        Ok(Self {
            common_name,
            authority,
            scheduler,
            hooks,
        })
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn hooks(&self) -> &TlsHooks {
        &self.hooks
    }

    /// Install the first certificate and start rotating.
    pub async fn start(&mut self) -> Result<RefreshOutcome> {
        let outcome = self.scheduler.start().await?;
        info!(
            "Serving as {} with certificate {} (expires {})",
            self.common_name, outcome.serial, outcome.not_after
        );
        Ok(outcome)
    }

    pub async fn shutdown(&mut self) {
        self.scheduler.stop().await;
    }

    /// Issue a single certificate outside the rotation state, then revoke and tidy it.
    pub async fn check(&self) -> Result<CheckReport> {
        let bundle = self.authority.issue(self.engine().request()).await?;
        let serial = bundle.serial.clone();
        let not_after = bundle.keypair.not_after();
        info!("Issued certificate {} (expires {})", serial, not_after);

        let revoked_at = self.authority.revoke(&serial).await?;
        info!("Revoked certificate {} at {}", serial, revoked_at);

        self.authority.tidy().await?;

        Ok(CheckReport {
            serial: serial.to_string(),
            not_after,
            revoked_at,
        })
    }

    pub fn engine(&self) -> &Arc<RotationEngine> {
        self.scheduler.engine()
    }
}

#[derive(Debug)]
pub struct CheckReport {
    pub serial: String,
    pub not_after: DateTime<Utc>,
    pub revoked_at: DateTime<Utc>,
}
