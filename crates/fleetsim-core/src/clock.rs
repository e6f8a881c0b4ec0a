//! Virtual clock for the execution kernel.
//!
//! The [`SimClock`] tracks simulation time independently of wall-clock time.
//! Only the kernel advances it, and only when it pops the next event, so the
//! same inputs always produce the same timeline.

use serde::{Deserialize, Serialize};

/// Virtual simulation clock, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    current_ms: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_ms: 0 }
    }

    /// Create a clock starting at a specific time.
    pub fn starting_at_ms(ms: u64) -> Self {
        Self { current_ms: ms }
    }

    /// Current time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.current_ms
    }

    /// Current time in seconds.
    pub fn now_secs(&self) -> f64 {
        self.current_ms as f64 / 1000.0
    }

    /// Absolute time `delay_ms` from now.
    pub fn after(&self, delay_ms: u64) -> u64 {
        self.current_ms.saturating_add(delay_ms)
    }

    /// Advance the clock to a specific time.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `ms` is in the past. The kernel checks this
    /// before calling and reports it as a fatal error instead.
    pub fn advance_to_ms(&mut self, ms: u64) {
        debug_assert!(
            ms >= self.current_ms,
            "Cannot move clock backwards: current={}ms, target={}ms",
            self.current_ms,
            ms,
        );
        self.current_ms = ms;
    }
}
