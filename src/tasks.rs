//! Background task bookkeeping.
//!
//! The database tracks two kinds of background work: the per-database
//! compaction worker and one segment-writer thread per in-flight commit.
//! [`WaitGroup`] lets `close()` drain the writers; [`Shutdown`] lets it
//! interrupt the worker's idle sleeps.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// WaitGroup
// ------------------------------------------------------------------------------------------------

/// Counts outstanding background tasks. `wait()` blocks until the count
/// returns to zero.
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    drained: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn add(&self, n: usize) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shutdown
// ------------------------------------------------------------------------------------------------

/// One-way shutdown flag with wakeable sleeps.
pub(crate) struct Shutdown {
    flagged: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            flagged: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut flagged = self.flagged.lock().unwrap_or_else(PoisonError::into_inner);
        *flagged = true;
        self.wake.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.flagged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for at most `timeout`. Returns `true` when the sleep ended
    /// early because shutdown was signalled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let flagged = self.flagged.lock().unwrap_or_else(PoisonError::into_inner);
        let (flagged, _) = self
            .wake
            .wait_timeout_while(flagged, timeout, |f| !*f)
            .unwrap_or_else(PoisonError::into_inner);
        *flagged
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
