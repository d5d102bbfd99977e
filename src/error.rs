//! Error types for throttling and admission control
use std::fmt;

/// Reason a queued call was settled without running.
///
/// Non-generic so queue purges don't need to know the transport's error
/// type; the controller converts it into [`ThrottleError`] at its boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The endpoint's daily quota is exhausted; retry after `resets_at`
    /// (epoch milliseconds).
    DailyLimit { resets_at: u64 },
    /// The queue was torn down before the call was dequeued.
    QueueClosed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyLimit { resets_at } => {
                write!(f, "daily request limit exhausted (resets at epoch-ms {})", resets_at)
            }
            Self::QueueClosed => write!(f, "task queue closed before the call ran"),
        }
    }
}

impl std::error::Error for Rejection {}

/// Unified error type for admitted calls.
///
/// `E` is the transport layer's error type; the engine never inspects it.
#[derive(Debug, Clone)]
pub enum ThrottleError<E> {
    /// The endpoint's daily quota is exhausted, either locally counted or
    /// reported by the remote service. Not retried.
    DailyLimit { resets_at: u64 },
    /// The remote service kept signalling transient rate limiting past the
    /// configured retry budget.
    RateLimitExhausted { attempts: usize },
    /// The remote service reported daily exhaustion on an endpoint with no
    /// configured daily rule. Add a rule for this endpoint.
    UnexpectedDailySignal { method: String, path: String },
    /// A non-2xx status outside the rate-limit protocol. Local to this call.
    OtherStatus { status: u16, body: serde_json::Value },
    /// The queue was torn down before the call was dequeued.
    QueueClosed,
    /// The transport layer itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ThrottleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyLimit { resets_at } => {
                write!(f, "daily request limit exhausted (resets at epoch-ms {})", resets_at)
            }
            Self::RateLimitExhausted { attempts } => {
                write!(f, "still rate limited after {} attempts", attempts)
            }
            Self::UnexpectedDailySignal { method, path } => {
                write!(
                    f,
                    "service reported a daily limit for {} {} but no daily rule is registered; \
                     add one for this endpoint",
                    method, path
                )
            }
            Self::OtherStatus { status, .. } => write!(f, "request failed with status {}", status),
            Self::QueueClosed => write!(f, "task queue closed before the call ran"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ThrottleError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<Rejection> for ThrottleError<E> {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::DailyLimit { resets_at } => Self::DailyLimit { resets_at },
            Rejection::QueueClosed => Self::QueueClosed,
        }
    }
}

impl<E> ThrottleError<E> {
    /// Check if this error is a daily-quota rejection.
    pub fn is_daily_limit(&self) -> bool {
        matches!(self, Self::DailyLimit { .. })
    }

    /// Check if this error is rate-limit retry exhaustion.
    pub fn is_rate_limit_exhausted(&self) -> bool {
        matches!(self, Self::RateLimitExhausted { .. })
    }

    /// Check if this error is an unexpected daily signal.
    pub fn is_unexpected_daily_signal(&self) -> bool {
        matches!(self, Self::UnexpectedDailySignal { .. })
    }

    /// Check if this error wraps a transport error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner transport error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner transport error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The reset boundary for a daily-limit error (epoch milliseconds).
    pub fn resets_at(&self) -> Option<u64> {
        match self {
            Self::DailyLimit { resets_at } => Some(*resets_at),
            _ => None,
        }
    }

    /// The HTTP status for an `OtherStatus` error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::OtherStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised while registering rules. Fatal at registration time, never
/// at call time.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A rule for the same (method, compiled pattern) pair already exists.
    #[error("a rule for {method} {template} is already registered")]
    DuplicateRule { method: String, template: String },
    /// The path template could not be compiled.
    #[error("malformed path template {template:?}: {reason}")]
    MalformedTemplate { template: String, reason: String },
    /// A limit value was out of range.
    #[error("invalid limit: {0}")]
    InvalidLimit(&'static str),
    /// The HTTP method was empty.
    #[error("HTTP method must not be empty")]
    EmptyMethod,
}
