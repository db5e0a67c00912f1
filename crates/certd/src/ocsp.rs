//! Per-domain OCSP staple refresh.
//!
//! The staple for a managed domain is re-fetched shortly (the OCSP window,
//! minus jitter) before the current response's `next_update`. The fetch runs
//! without holding any lock; only the final swap takes the state's staple
//! lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use certd_common::{delay_until, retry_backoff};
use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::error::{CertError, CertResult, OcspError};
use crate::manager::CertManager;
use crate::state::OcspStaple;
use crate::timer::{FireFn, TimerSlot, Timing};

/// Fetches an OCSP response for a leaf from its issuer's responder
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    async fn fetch(
        &self,
        leaf: &CertificateDer<'static>,
        issuer: &CertificateDer<'static>,
    ) -> Result<OcspStaple, OcspError>;
}

/// Background staple refresh timer for one domain
pub struct OcspUpdater {
    domain: String,
    manager: Weak<CertManager>,
    fetcher: Arc<dyn OcspFetcher>,
    timing: Timing,
    slot: TimerSlot,
}

impl OcspUpdater {
    pub(crate) fn new(
        domain: impl Into<String>,
        manager: Weak<CertManager>,
        fetcher: Arc<dyn OcspFetcher>,
        timing: Timing,
    ) -> Arc<Self> {
        let domain = domain.into();
        Arc::new(Self {
            slot: TimerSlot::new("ocsp", domain.clone()),
            domain,
            manager,
            fetcher,
            timing,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Arm the timer for a staple whose next update is `next_update`.
    ///
    /// No-op if already armed.
    pub fn start(self: &Arc<Self>, next_update: DateTime<Utc>) -> bool {
        let delay = self.next(next_update);
        self.slot.start(delay, Self::fire_fn(Arc::downgrade(self)))
    }

    /// Disarm and immediately re-arm so the current leaf gets a fresh staple
    pub fn restart(self: &Arc<Self>) {
        self.slot.stop();
        self.start(Utc::now());
    }

    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.is_armed()
    }

    pub fn arm_count(&self) -> u64 {
        self.slot.arm_count()
    }

    /// Delay until the OCSP window before `next_update` opens, minus jitter
    pub fn next(&self, next_update: DateTime<Utc>) -> Duration {
        delay_until(next_update, self.timing.ocsp_window, self.timing.jitter)
    }

    fn fire_fn(this: Weak<Self>) -> FireFn {
        Box::new(move |epoch| {
            Box::pin(async move {
                if let Some(this) = this.upgrade() {
                    this.tick(epoch).await;
                }
            })
        })
    }

    async fn tick(self: Arc<Self>, epoch: u64) {
        if !self.slot.begin_fire(epoch) {
            return;
        }

        let next = match self.update().await {
            Ok(next) => next,
            Err(CertError::Shutdown) => {
                debug!(domain = %self.domain, "Manager gone, OCSP loop exiting");
                self.slot.disarm(epoch);
                return;
            }
            Err(e) => {
                let backoff = retry_backoff(self.timing.jitter);
                warn!(
                    domain = %self.domain,
                    error = %e,
                    retry_secs = backoff.as_secs(),
                    "OCSP staple refresh failed, keeping previous staple"
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.metrics().record_ocsp_failure(&self.domain);
                }
                backoff
            }
        };

        self.slot
            .rearm(epoch, next, Self::fire_fn(Arc::downgrade(&self)));
    }

    /// Fetch and install one staple. Returns the delay until the next refresh.
    pub async fn update(&self) -> CertResult<Duration> {
        let manager = self.manager.upgrade().ok_or(CertError::Shutdown)?;
        let state = manager
            .state(&self.domain)
            .ok_or_else(|| OcspError::new(format!("domain '{}' is not managed", self.domain)))?;
        let metrics = Arc::clone(manager.metrics());
        drop(manager);

        let cert = Arc::clone(state.certificate());
        let issuer = cert
            .issuer_der()
            .ok_or_else(|| OcspError::new("certificate chain has no issuer certificate"))?;

        let staple = tokio::time::timeout(
            self.timing.ocsp_timeout,
            self.fetcher.fetch(cert.leaf_der(), issuer),
        )
        .await
        .map_err(|_| CertError::Timeout(self.timing.ocsp_timeout))??;

        let next = self.next(staple.next_update);
        debug!(
            domain = %self.domain,
            serial = %cert.serial(),
            next_update = %staple.next_update,
            next_secs = next.as_secs(),
            "OCSP staple refreshed"
        );
        state.set_ocsp_staple(staple);
        metrics.record_ocsp_refresh(&self.domain);

        Ok(next)
    }
}

impl std::fmt::Debug for OcspUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcspUpdater")
            .field("domain", &self.domain)
            .field("armed", &self.slot.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCalled;

    #[async_trait]
    impl OcspFetcher for NeverCalled {
        async fn fetch(
            &self,
            _leaf: &CertificateDer<'static>,
            _issuer: &CertificateDer<'static>,
        ) -> Result<OcspStaple, OcspError> {
            Err(OcspError::new("unexpected fetch"))
        }
    }

    fn updater() -> Arc<OcspUpdater> {
        OcspUpdater::new("example.com", Weak::new(), Arc::new(NeverCalled), Timing::default())
    }

    #[test]
    fn test_next_uses_ocsp_window() {
        let updater = updater();
        let hour = Duration::from_secs(3600);

        // Inside the 48h window
        assert_eq!(updater.next(Utc::now() + chrono::Duration::hours(24)), Duration::ZERO);

        let next = updater.next(Utc::now() + chrono::Duration::hours(96));
        assert!(next <= 48 * hour);
        assert!(next + hour + Duration::from_secs(5) >= 48 * hour);
    }

    #[tokio::test]
    async fn test_update_without_manager() {
        assert!(matches!(updater().update().await, Err(CertError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_without_manager_goes_idle() {
        let updater = updater();
        assert!(updater.start(Utc::now()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(!updater.is_armed());
        assert_eq!(updater.arm_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rearms() {
        let updater = updater();
        assert!(updater.start(Utc::now() + chrono::Duration::days(7)));
        updater.restart();
        assert!(updater.is_armed());
        assert_eq!(updater.arm_count(), 2);
        updater.stop();
    }
}
