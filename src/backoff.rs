//! Pause-length strategies for rate-limit signals without a retry hint.
//!
//! When the remote service answers 429 without a usable retry hint, the
//! controller falls back to one of these strategies to pick the pause
//! length. Attempt semantics: attempt `1` is the first consecutive 429 on a
//! call; attempt `0` means "no failure yet" and yields no delay. Delays
//! saturate at `MAX_BACKOFF` to avoid overflow.

use std::fmt;
use std::time::Duration;

/// Maximum fallback pause used when calculations overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant,
    Exponential,
}

/// Fallback pause strategy: constant or exponential, with an optional cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same pause for every consecutive 429.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant, base: delay, max: None }
    }

    /// Doubling pause per consecutive 429: base, 2*base, 4*base, ...
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential, base, max: None }
    }

    /// Cap the pause length. Only meaningful for exponential growth.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Pause before retry `attempt` (1-indexed; `0` yields zero).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.kind {
            BackoffKind::Constant => self.base,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// One second, doubling, capped at one minute. A sane default for HTTP
    /// 429 handling when the service gives no hint.
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1))
            .with_max(Duration::from_secs(60))
            .unwrap_or_else(|_| Backoff::constant(Duration::from_secs(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_yields_no_delay() {
        assert_eq!(Backoff::constant(Duration::from_secs(5)).delay(0), Duration::ZERO);
        assert_eq!(Backoff::exponential(Duration::from_secs(5)).delay(0), Duration::ZERO);
    }

    #[test]
    fn constant_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(2)).unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(2));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validates() {
        let err = Backoff::exponential(Duration::from_secs(2)).with_max(Duration::ZERO);
        assert_eq!(err.unwrap_err(), BackoffError::MaxMustBePositive);

        let err = Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1));
        assert!(matches!(err, Err(BackoffError::MaxLessThanBase { .. })));
    }

    #[test]
    fn default_is_capped_exponential() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(30), Duration::from_secs(60));
    }
}
