//! Clocks
//!
//! Millisecond time sources. Everything in the runtime reads time through
//! [`Clock`] so that tests can drive the scheduler on virtual time.

use std::cell::Cell;
use std::time::Instant;

/// Monotonic millisecond time source.
pub trait Clock {
    /// Milliseconds elapsed since the clock's origin.
    fn now(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations.
///
/// Pair it with [`Timer::advance`](crate::Timer::advance) to step through
/// scheduled work deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self { now: Cell::new(start) }
    }

    /// Move the clock to `time`. Time never goes backwards.
    pub fn set(&self, time: u64) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    /// Move the clock forward by `ms`.
    pub fn add(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(100);
        clock.set(50);
        assert_eq!(clock.now(), 100);

        clock.set(150);
        clock.add(25);
        assert_eq!(clock.now(), 175);
    }

    #[test]
    fn test_system_clock_starts_near_zero() {
        let clock = SystemClock::new();
        assert!(clock.now() < 1000);
    }
}
