//! Per-domain background certificate renewal.
//!
//! Each managed domain owns one [`RenewalScheduler`]. It sleeps until the
//! renew-before window (minus jitter) opens, re-checks the shared store in
//! case another instance already renewed, and otherwise asks the issuer for a
//! new certificate. Every cycle reschedules itself; failures only shorten the
//! next delay.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use certd_common::{delay_until, retry_backoff};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cert::{Certificate, KeyMaterial};
use crate::error::{CertError, CertResult};
use crate::manager::CertManager;
use crate::timer::{FireFn, TimerSlot, Timing};

/// Background renewal timer for one domain
pub struct RenewalScheduler {
    domain: String,
    key: KeyMaterial,
    manager: Weak<CertManager>,
    timing: Timing,
    slot: TimerSlot,
}

impl RenewalScheduler {
    pub(crate) fn new(
        domain: impl Into<String>,
        key: KeyMaterial,
        manager: Weak<CertManager>,
        timing: Timing,
    ) -> Arc<Self> {
        let domain = domain.into();
        Arc::new(Self {
            slot: TimerSlot::new("renewal", domain.clone()),
            domain,
            key,
            manager,
            timing,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Arm the timer for a certificate expiring at `expiry`.
    ///
    /// No-op if already armed.
    pub fn start(self: &Arc<Self>, expiry: DateTime<Utc>) -> bool {
        let delay = self.next(expiry);
        let started = self.slot.start(delay, Self::fire_fn(Arc::downgrade(self)));
        if started {
            debug!(
                domain = %self.domain,
                next_secs = delay.as_secs(),
                "Renewal scheduler started"
            );
        }
        started
    }

    /// Disarm the timer. An attempt already running completes but does not
    /// reschedule.
    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.is_armed()
    }

    /// Number of timers created so far
    pub fn arm_count(&self) -> u64 {
        self.slot.arm_count()
    }

    /// Delay until the renew-before window for `expiry` opens, minus jitter
    pub fn next(&self, expiry: DateTime<Utc>) -> Duration {
        delay_until(expiry, self.timing.renew_before, self.timing.jitter)
    }

    fn fire_fn(this: Weak<Self>) -> FireFn {
        Box::new(move |epoch| {
            Box::pin(async move {
                if let Some(this) = this.upgrade() {
                    this.renew(epoch).await;
                }
            })
        })
    }

    async fn renew(self: Arc<Self>, epoch: u64) {
        if !self.slot.begin_fire(epoch) {
            return;
        }

        let started = Instant::now();
        let next = match tokio::time::timeout(self.timing.attempt_timeout, self.attempt()).await {
            Ok(Ok(next)) => next,
            Ok(Err(CertError::Shutdown)) => {
                debug!(domain = %self.domain, "Manager gone, renewal loop exiting");
                self.slot.disarm(epoch);
                return;
            }
            Ok(Err(e)) => {
                let backoff = retry_backoff(self.timing.jitter);
                warn!(
                    domain = %self.domain,
                    error = %e,
                    retry_secs = backoff.as_secs(),
                    "Certificate renewal failed"
                );
                backoff
            }
            Err(_) => {
                let backoff = retry_backoff(self.timing.jitter);
                warn!(
                    domain = %self.domain,
                    timeout_secs = self.timing.attempt_timeout.as_secs(),
                    retry_secs = backoff.as_secs(),
                    "Certificate renewal timed out"
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.metrics().record_issuance_failure(&self.domain);
                }
                backoff
            }
        };

        debug!(
            domain = %self.domain,
            elapsed_ms = started.elapsed().as_millis() as u64,
            next_secs = next.as_secs(),
            "Renewal cycle finished"
        );

        self.slot
            .rearm(epoch, next, Self::fire_fn(Arc::downgrade(&self)));
    }

    /// One renewal attempt. Returns the delay until the next one.
    ///
    /// The cached certificate is consulted first: when it is valid for longer
    /// than the renew-before window plus the jitter ceiling, nothing is issued.
    pub async fn attempt(&self) -> CertResult<Duration> {
        let manager = self.manager.upgrade().ok_or(CertError::Shutdown)?;

        match manager.cache_get(&self.domain).await {
            Ok(cached) => {
                if cached.remaining() > self.timing.renew_before + self.timing.jitter {
                    let next = self.next(cached.not_after());
                    debug!(
                        domain = %self.domain,
                        not_after = %cached.not_after(),
                        next_secs = next.as_secs(),
                        "Cached certificate is still fresh, skipping issuance"
                    );
                    manager.metrics().record_renewal_skipped(&self.domain);
                    manager.adopt(&self.domain, cached);
                    return Ok(next);
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(domain = %self.domain, "No cached certificate, issuing");
            }
            Err(CertError::Parse(reason)) => {
                warn!(domain = %self.domain, reason = %reason, "Cached certificate unreadable, issuing");
            }
            Err(e) => return Err(e),
        }

        let cert: Certificate = manager.obtain(&self.domain, &self.key).await?;
        if let Err(e) = manager.cache_put(&self.domain, &cert).await {
            // The new certificate is still served from memory
            warn!(domain = %self.domain, error = %e, "Failed to persist renewed certificate");
        }

        let not_after = cert.not_after();
        info!(
            domain = %self.domain,
            serial = %cert.serial(),
            not_after = %not_after,
            "Certificate renewed"
        );
        manager.install(&self.domain, Arc::new(cert));
        drop(manager);

        Ok(self.next(not_after))
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("domain", &self.domain)
            .field("armed", &self.slot.is_armed())
            .field("timing", &self.timing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn scheduler() -> Arc<RenewalScheduler> {
        RenewalScheduler::new(
            "example.com",
            KeyMaterial::generate().unwrap(),
            Weak::new(),
            Timing::default(),
        )
    }

    #[test]
    fn test_next_bounds() {
        let scheduler = scheduler();
        let timing = Timing::default();
        let expiry = Utc::now() + chrono::Duration::days(90);

        let next = scheduler.next(expiry);
        assert!(next <= 60 * DAY);
        assert!(next + timing.jitter + Duration::from_secs(5) >= 60 * DAY);
    }

    #[test]
    fn test_next_due_is_zero() {
        let scheduler = scheduler();
        let expiry = Utc::now() + chrono::Duration::days(5);
        assert_eq!(scheduler.next(expiry), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_attempt_without_manager() {
        let scheduler = scheduler();
        assert!(matches!(scheduler.attempt().await, Err(CertError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_without_manager_does_not_rearm() {
        let scheduler = scheduler();
        assert!(scheduler.start(Utc::now()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(scheduler.arm_count(), 1);
        assert!(!scheduler.is_armed());

        // Idle again, so a later start arms a fresh timer
        assert!(scheduler.start(Utc::now() + chrono::Duration::days(90)));
        assert_eq!(scheduler.arm_count(), 2);
        scheduler.stop();
    }
}
