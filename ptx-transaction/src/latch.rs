//! Countdown latch a procedure blocks on while one round of fragments is outstanding.

use std::sync::{Condvar, Mutex};

use ptx_common::error::{PtxError, PtxResult};

#[derive(Debug, Default)]
struct LatchState {
    remaining: usize,
    cancelled: bool,
}

/// Mutex + condvar countdown, cancellable on shutdown.
#[derive(Debug, Default)]
pub struct RoundLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl RoundLatch {
    /// Creates a latch expecting `count` arrivals.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                remaining: count,
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Records one arrival. Returns `true` when this arrival opened the latch.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the latch mutex is poisoned.
    pub fn count_down(&self) -> PtxResult<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PtxError::InvalidState("round latch mutex is poisoned"))?;
        if state.remaining == 0 {
            return Ok(false);
        }
        state.remaining -= 1;
        let opened = state.remaining == 0;
        if opened {
            self.changed.notify_all();
        }
        Ok(opened)
    }

    /// Wakes every waiter with a shutdown error.
    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.cancelled = true;
        }
        self.changed.notify_all();
    }

    /// Arrivals still expected.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.state.lock().map_or(0, |state| state.remaining)
    }

    /// Blocks until every arrival happened.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Shutdown` when the latch was cancelled, or `PtxError::InvalidState`
    /// when the latch mutex is poisoned.
    pub fn wait(&self) -> PtxResult<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| PtxError::InvalidState("round latch mutex is poisoned"))?;
        let state = self
            .changed
            .wait_while(state, |state| state.remaining > 0 && !state.cancelled)
            .map_err(|_| PtxError::InvalidState("round latch mutex is poisoned"))?;
        if state.remaining > 0 {
            return Err(PtxError::Shutdown);
        }
        Ok(())
    }
}
