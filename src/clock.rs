//! Clock abstractions used by quota reset arithmetic and pause deadlines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds in one UTC day.
pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Clock abstraction so wall-clock timing can be faked in tests.
///
/// Returns milliseconds since the Unix epoch. Daily quota resets are a
/// wall-clock boundary (UTC midnight), so a monotonic clock is not enough
/// here.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    /// The next UTC-midnight boundary strictly after now.
    fn next_utc_midnight(&self) -> u64 {
        let now = self.now_millis();
        (now / MILLIS_PER_DAY + 1) * MILLIS_PER_DAY
    }
}

/// Production clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(now_millis)) }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_epoch_based() {
        // Any moment after 2020-01-01 will do as a sanity floor.
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn manual_clock_moves_only_on_demand() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_millis(), 42);
    }

    #[test]
    fn next_utc_midnight_is_strictly_in_the_future() {
        let clock = ManualClock::new(3 * MILLIS_PER_DAY + 12 * 60 * 60 * 1000);
        assert_eq!(clock.next_utc_midnight(), 4 * MILLIS_PER_DAY);

        // Exactly on the boundary still advances to the next one.
        let clock = ManualClock::new(4 * MILLIS_PER_DAY);
        assert_eq!(clock.next_utc_midnight(), 5 * MILLIS_PER_DAY);
    }
}
