//! Jittered scheduling arithmetic for background certificate timers.
//!
//! All delays are clamped to zero: a deadline that is already in the past
//! fires immediately instead of being scheduled "in the past".

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Uniformly random duration in `[0, ceiling)`.
///
/// A zero ceiling yields zero.
pub fn jitter(ceiling: Duration) -> Duration {
    let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// Delay until `window` before `expiry`, minus a random jitter in
/// `[0, jitter_ceiling)`, measured from now.
pub fn delay_until(expiry: DateTime<Utc>, window: Duration, jitter_ceiling: Duration) -> Duration {
    delay_until_at(Utc::now(), expiry, window, jitter_ceiling)
}

/// Same as [`delay_until`] with an explicit reference time
pub fn delay_until_at(
    now: DateTime<Utc>,
    expiry: DateTime<Utc>,
    window: Duration,
    jitter_ceiling: Duration,
) -> Duration {
    let remaining = (expiry - now).to_std().unwrap_or(Duration::ZERO);
    remaining
        .saturating_sub(window)
        .saturating_sub(jitter(jitter_ceiling))
}

/// Short retry delay after a failed background attempt.
///
/// Half the jitter ceiling plus a further random amount in `[0, half)`.
pub fn retry_backoff(jitter_ceiling: Duration) -> Duration {
    let half = jitter_ceiling / 2;
    half + jitter(half)
}
