//! Monotonic time source used to decide when an averaging window closes.

use crate::lock_or_recover;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of "now" for window timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock monotonic time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when [`ManualClock::advance`] is called.
///
/// Lets tests close windows deterministically regardless of how fast the
/// sampling thread actually runs.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = lock_or_recover(&self.offset, "manual clock");
        *offset = offset.saturating_add(by);
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        *lock_or_recover(&self.offset, "manual clock")
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}
