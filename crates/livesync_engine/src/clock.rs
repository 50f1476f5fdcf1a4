//! Time source for the coalescing scheduler.
//!
//! Production code uses [`SystemClock`]. Tests use [`ManualClock`] and
//! advance it explicitly, so batching behaviour is deterministic.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::Instant;

/// A monotonic millisecond time source.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time in milliseconds from an arbitrary origin.
    fn now_millis(&self) -> u64;
}

/// Clock backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: Mutex<u64>,
}

impl ManualClock {
    /// Creates a clock at the given time.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Mutex::new(millis),
        }
    }

    /// Advances the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        *self.millis.lock() += ms;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, ms: u64) {
        *self.millis.lock() = ms;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        *self.millis.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_millis(), 1000);
        assert_eq!(clock.now_millis(), 1000);

        clock.advance(50);
        assert_eq!(clock.now_millis(), 1050);

        clock.set(7);
        assert_eq!(clock.now_millis(), 7);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
