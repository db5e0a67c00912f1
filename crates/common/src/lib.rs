//! Shared primitives for the certd certificate daemon.
//!
//! - [`SingleFlightCell`]: a read-mostly, lazily initialized shared value whose
//!   slow path collapses concurrent initializers into a single call
//! - [`schedule`]: jittered delay and retry backoff computations used by the
//!   per-domain renewal and OCSP timers

pub mod schedule;
pub mod single_flight;

pub use schedule::{delay_until, delay_until_at, jitter, retry_backoff};
pub use single_flight::SingleFlightCell;
