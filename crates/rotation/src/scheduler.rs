//! Jittered periodic refresh.
//!
//! The scheduler owns the cancellation token and the task handle from the
//! moment the background task exists, so `stop()` always reaches it.

use rand::Rng;
use sidecar_types::{Result, RotationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{RefreshOutcome, RotationEngine};

/// Nominal period scaled by a factor drawn uniformly from `[jitter_min, jitter_max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    period: Duration,
    jitter_min: f64,
    jitter_max: f64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            jitter_min: 0.7,
            jitter_max: 0.9,
        }
    }
}

impl RefreshPolicy {
    pub fn new(period: Duration, jitter_min: f64, jitter_max: f64) -> Result<Self> {
        if period.is_zero() {
            return Err(RotationError::Config(
                "Refresh period must be greater than zero".to_string(),
            ));
        }
        if !(jitter_min > 0.0 && jitter_min <= jitter_max && jitter_max.is_finite()) {
            return Err(RotationError::Config(format!(
                "Invalid jitter range {}..{}",
                jitter_min, jitter_max
            )));
        }
        // Every drawn delay is at most this long, so it must fit in a Duration.
        Duration::try_from_secs_f64(period.as_secs_f64() * jitter_max).map_err(|e| {
            RotationError::Config(format!(
                "Refresh delay {:?} x {} is out of range: {}",
                period, jitter_max, e
            ))
        })?;

        Ok(Self {
            period,
            jitter_min,
            jitter_max,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Delay before the next trigger.
    pub fn next_delay(&self) -> Duration {
        let factor = if self.jitter_min == self.jitter_max {
            self.jitter_min
        } else {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        };
        self.period.mul_f64(factor)
    }

    /// Longest delay the policy can produce.
    pub fn max_delay(&self) -> Duration {
        self.period.mul_f64(self.jitter_max)
    }
}

pub struct RefreshScheduler {
    engine: Arc<RotationEngine>,
    policy: RefreshPolicy,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn new(engine: Arc<RotationEngine>, policy: RefreshPolicy) -> Self {
        Self {
            engine,
            policy,
            cancel: None,
            task: None,
        }
    }

    pub fn engine(&self) -> &Arc<RotationEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Perform the initial rotation, then begin periodic triggering.
    ///
    /// # Errors
    /// `Initialization` if no initial certificate could be issued; nothing is
    /// scheduled in that case. `Scheduler` if already started.
    pub async fn start(&mut self) -> Result<RefreshOutcome> {
        if self.task.is_some() {
            return Err(RotationError::Scheduler(
                "Refresh scheduler already started".to_string(),
            ));
        }

        let outcome = self.engine.initialize().await?;

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.task = Some(tokio::spawn(refresh_loop(
            Arc::clone(&self.engine),
            self.policy,
            cancel,
        )));

        info!(
            "Certificate refresh scheduled every {:?} x [{}, {}]",
            self.policy.period(),
            self.policy.jitter_min,
            self.policy.jitter_max
        );
        Ok(outcome)
    }

    /// Cancel future triggers and wait for an in-flight rotation to finish.
    ///
    /// No trigger fires after this returns. Safe to call repeatedly or
    /// without a prior `start()`.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Refresh task panicked: {:?}", e);
            }
            info!("Certificate refresh stopped");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        // Can't await in drop; the task exits at its next cancellation check.
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn refresh_loop(engine: Arc<RotationEngine>, policy: RefreshPolicy, cancel: CancellationToken) {
    loop {
        let delay = policy.next_delay();
        debug!("Next certificate refresh in {:?}", delay);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = engine.refresh().await {
            if !e.is_refresh_failure() {
                warn!("Unexpected refresh error: {}", e);
            }
            if let Some(snapshot) = engine.state().read() {
                if snapshot.keypair().expires_within(policy.max_delay()) {
                    warn!(
                        "Certificate {} expires at {}, before the next refresh attempt",
                        snapshot.serial(),
                        snapshot.keypair().not_after()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecar_pki::testing::ScriptedAuthority;
    use sidecar_pki::IssueRequest;
    use sidecar_types::Serial;

    fn scheduler(authority: &Arc<ScriptedAuthority>, policy: RefreshPolicy) -> RefreshScheduler {
        let request = IssueRequest::new(
            "dumbserver",
            vec!["localhost".to_string()],
            Duration::from_secs(300),
        );
        let engine = Arc::new(RotationEngine::new(authority.clone(), request));
        RefreshScheduler::new(engine, policy)
    }

    #[test]
    fn test_default_policy_delay_band() {
        let policy = RefreshPolicy::default();
        for _ in 0..1000 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_secs(42), "too short: {:?}", delay);
            assert!(delay <= Duration::from_secs(54), "too long: {:?}", delay);
        }
        assert_eq!(policy.max_delay(), Duration::from_secs(54));
    }

    #[test]
    fn test_policy_rejects_invalid_jitter() {
        assert!(RefreshPolicy::new(Duration::from_secs(60), 0.9, 0.7).is_err());
        assert!(RefreshPolicy::new(Duration::from_secs(60), 0.0, 0.7).is_err());
        assert!(RefreshPolicy::new(Duration::ZERO, 0.7, 0.9).is_err());
        assert!(RefreshPolicy::new(Duration::from_secs(60), 1.0, 1.0).is_ok());
    }

    #[test]
    fn test_policy_rejects_unrepresentable_delay() {
        let err = RefreshPolicy::new(Duration::from_secs(60), 0.7, 1e300).unwrap_err();
        assert!(matches!(err, RotationError::Config(_)));

        let err = RefreshPolicy::new(Duration::MAX, 0.7, 2.0).unwrap_err();
        assert!(matches!(err, RotationError::Config(_)));

        let policy = RefreshPolicy::new(Duration::from_secs(3600), 0.5, 24.0).unwrap();
        assert_eq!(policy.max_delay(), Duration::from_secs(86_400));
        assert_eq!(policy.period(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let authority = Arc::new(ScriptedAuthority::new());
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        scheduler.stop().await;
        scheduler.stop().await;

        assert!(!scheduler.is_running());
        assert_eq!(authority.issue_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_without_initial_certificate() {
        let authority = Arc::new(ScriptedAuthority::new());
        authority.push_failure(RotationError::Issuance("vault sealed".to_string()));
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        let err = scheduler.start().await.unwrap_err();

        assert!(matches!(err, RotationError::Initialization(_)));
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_installs_initial_certificate() {
        let authority = Arc::new(ScriptedAuthority::new());
        authority.push_serial("S1");
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        let outcome = scheduler.start().await.unwrap();

        assert_eq!(outcome.serial, Serial::from("S1"));
        let snapshot = scheduler.engine().state().read().unwrap();
        assert_eq!(snapshot.keypair().serial(), &Serial::from("S1"));
        assert!(scheduler.is_running());

        assert!(matches!(
            scheduler.start().await,
            Err(RotationError::Scheduler(_))
        ));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_rotation_revokes_previous() {
        let authority = Arc::new(ScriptedAuthority::new());
        authority.push_serial("S1");
        authority.push_serial("S2");
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        scheduler.start().await.unwrap();
        // Longest possible first delay is 54s.
        tokio::time::sleep(Duration::from_secs(55)).await;

        assert_eq!(
            scheduler.engine().state().current_serial(),
            Some(Serial::from("S2"))
        );
        assert_eq!(authority.revoked(), vec![Serial::from("S1")]);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trigger_keeps_serving_and_retries() {
        let authority = Arc::new(ScriptedAuthority::new());
        authority.push_serial("S1");
        authority.push_failure(RotationError::Issuance("connection reset".to_string()));
        authority.push_serial("S3");
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());
        let mut events = scheduler.engine().subscribe();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(55)).await;

        assert_eq!(authority.issue_count(), 2);
        assert_eq!(
            scheduler.engine().state().current_serial(),
            Some(Serial::from("S1"))
        );
        assert!(authority.revoked().is_empty());

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(
            scheduler.engine().state().current_serial(),
            Some(Serial::from("S3"))
        );
        assert_eq!(authority.revoked(), vec![Serial::from("S1")]);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, sidecar_types::RotationEvent::RefreshFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_triggers_after_stop() {
        let authority = Arc::new(ScriptedAuthority::new());
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        let issued = authority.issue_count();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(authority.issue_count(), issued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let authority = Arc::new(ScriptedAuthority::new());
        let mut scheduler = scheduler(&authority, RefreshPolicy::default());

        scheduler.start().await.unwrap();
        scheduler.stop().await;
        scheduler.start().await.unwrap();

        assert!(scheduler.is_running());
        assert_eq!(authority.issue_count(), 2);
        // The restart's initial rotation displaced the first certificate.
        assert_eq!(authority.revoked(), vec![Serial::from("S1")]);
        scheduler.stop().await;
    }
}
