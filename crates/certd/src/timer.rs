//! Two-state (idle/armed) single-shot timer shared by the renewal scheduler
//! and the OCSP updater.
//!
//! A fire is identified by the epoch it was armed under. `stop` bumps the
//! epoch, so a callback that wakes up after a stop sees a mismatch and exits
//! without rearming. A callback that already passed [`TimerSlot::begin_fire`]
//! runs to completion but its [`TimerSlot::rearm`] is refused.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use certd_config::RenewalConfig;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Boxed timer callback body
pub type FireFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builds the callback body for the epoch the timer was armed under
pub type FireFn = Box<dyn FnOnce(u64) -> FireFuture + Send + 'static>;

#[derive(Debug, Default)]
struct SlotState {
    armed: bool,
    epoch: u64,
    handle: Option<JoinHandle<()>>,
}

/// One pending timer callback per slot
#[derive(Debug)]
pub struct TimerSlot {
    label: &'static str,
    domain: String,
    state: Mutex<SlotState>,
    arms: AtomicU64,
}

impl TimerSlot {
    pub fn new(label: &'static str, domain: impl Into<String>) -> Self {
        Self {
            label,
            domain: domain.into(),
            state: Mutex::new(SlotState::default()),
            arms: AtomicU64::new(0),
        }
    }

    /// Arm the timer unless it is already armed.
    ///
    /// Returns `false` (and drops `fire`) when the slot was already armed.
    pub fn start(&self, delay: Duration, fire: FireFn) -> bool {
        let mut state = self.state.lock();
        if state.armed {
            trace!(timer = self.label, domain = %self.domain, "Timer already armed");
            return false;
        }
        state.armed = true;
        state.epoch += 1;
        let epoch = state.epoch;
        state.handle = Some(self.spawn(delay, epoch, fire));
        true
    }

    /// Disarm the timer. A pending sleep is cancelled; a callback already in
    /// progress finishes its attempt but will not rearm.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        if !state.armed {
            return false;
        }
        state.armed = false;
        state.epoch += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        trace!(timer = self.label, domain = %self.domain, "Timer stopped");
        true
    }

    /// Called first thing by a fired callback. Returns `false` if the slot was
    /// stopped (or restarted) since this fire was armed.
    pub fn begin_fire(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.epoch != epoch {
            return false;
        }
        // Detach: stop() must not abort the attempt that is now running
        state.handle = None;
        true
    }

    /// Schedule the next fire for `epoch`. Refused if the slot was stopped
    /// while the attempt ran.
    pub fn rearm(&self, epoch: u64, delay: Duration, fire: FireFn) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.epoch != epoch {
            trace!(timer = self.label, domain = %self.domain, "Timer stopped during attempt, not rearming");
            return false;
        }
        state.handle = Some(self.spawn(delay, epoch, fire));
        true
    }

    /// Return to idle from inside the callback armed under `epoch`, when the
    /// loop ends without scheduling another fire
    pub fn disarm(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.epoch != epoch {
            return false;
        }
        state.armed = false;
        state.epoch += 1;
        state.handle = None;
        trace!(timer = self.label, domain = %self.domain, "Timer loop ended");
        true
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Number of timers created over the slot's lifetime
    pub fn arm_count(&self) -> u64 {
        self.arms.load(Ordering::Relaxed)
    }

    fn spawn(&self, delay: Duration, epoch: u64, fire: FireFn) -> JoinHandle<()> {
        self.arms.fetch_add(1, Ordering::Relaxed);
        trace!(
            timer = self.label,
            domain = %self.domain,
            delay_secs = delay.as_secs(),
            "Timer armed"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(epoch).await;
        })
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Timing policy
// ============================================================================

/// Windows, jitter and deadlines used by the background timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Renew this long before the certificate expires
    pub renew_before: Duration,
    /// Maximum random deviation subtracted from every deadline
    pub jitter: Duration,
    /// Deadline for one issuance attempt
    pub attempt_timeout: Duration,
    /// Refresh the OCSP staple this long before its next update
    pub ocsp_window: Duration,
    /// Deadline for one OCSP fetch
    pub ocsp_timeout: Duration,
}

impl Timing {
    pub fn from_config(config: &RenewalConfig) -> Self {
        Self {
            renew_before: config.renew_before(),
            jitter: config.jitter(),
            attempt_timeout: config.attempt_timeout(),
            ocsp_window: config.ocsp_window(),
            ocsp_timeout: config.ocsp_timeout(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&RenewalConfig::default())
    }
}
