//! Lazily initialized singleton with slow-path collapsing.
//!
//! Readers never lock: a populated cell is served with a single atomic load.
//! The first callers to find the cell empty serialize on an async mutex, and
//! only the one that wins the lock runs the initializer. Everyone else re-checks
//! the cell after acquiring the lock and returns the value that was installed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;
use tracing::trace;

/// Read-mostly shared cell initialized at most once per empty period.
///
/// The value is always swapped as a whole; concurrent readers either see the
/// previous `Arc` or the new one, never a partially written value.
pub struct SingleFlightCell<T> {
    value: ArcSwapOption<T>,
    init_lock: Mutex<()>,
}

impl<T> SingleFlightCell<T> {
    /// Create an empty cell
    pub fn new() -> Self {
        Self {
            value: ArcSwapOption::new(None),
            init_lock: Mutex::new(()),
        }
    }

    /// Get the current value without locking
    #[inline]
    pub fn get(&self) -> Option<Arc<T>> {
        self.value.load_full()
    }

    /// Whether the cell currently holds a value
    pub fn is_initialized(&self) -> bool {
        self.value.load().is_some()
    }

    /// Get the value, running `init` if the cell is empty.
    ///
    /// Concurrent callers that find the cell empty wait for the single
    /// in-flight initializer and share its result. If `init` fails the cell
    /// stays empty and the error is returned to the caller that ran it; the
    /// next waiter then gets its own attempt.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.value.load_full() {
            return Ok(value);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(value) = self.value.load_full() {
            trace!("Single-flight cell initialized by a concurrent caller");
            return Ok(value);
        }

        let value = Arc::new(init().await?);
        self.value.store(Some(Arc::clone(&value)));
        Ok(value)
    }

    /// Replace the value, returning the previous one
    pub fn replace(&self, value: T) -> Option<Arc<T>> {
        self.value.swap(Some(Arc::new(value)))
    }

    /// Empty the cell only if it still holds `current`.
    ///
    /// Returns `false` when another caller already replaced or removed it, so
    /// a stale value can be evicted without discarding its replacement.
    pub fn clear_if(&self, current: &Arc<T>) -> bool {
        let expected = Some(Arc::clone(current));
        let previous = self.value.compare_and_swap(&expected, None::<Arc<T>>);
        matches!(&*previous, Some(prev) if Arc::ptr_eq(prev, current))
    }
}

impl<T> Default for SingleFlightCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SingleFlightCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCell")
            .field("value", &self.value.load_full())
            .finish()
    }
}
