//! Jitter for fallback pauses to prevent synchronized retry storms
//!
//! Many throttles backing off on the same schedule would hit the remote
//! service in lockstep when their pauses lift. Randomizing the fallback
//! pause spreads that load. Pauses derived from the service's own retry
//! hint are never jittered; the hint is authoritative.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing fallback pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter - use the exact backoff delay. For tests and strict pacing.
    None,
    /// Full jitter: uniform in [0, delay].
    Full,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let max_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if max_millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng().random_range(0..=max_millis))
            }
        }
    }
}
