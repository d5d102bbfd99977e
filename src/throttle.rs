//! Per-endpoint throttle: daily quota counter plus optional paced queue
//!
//! Quota (long-horizon, day-granularity, vendor-authoritative on failure)
//! and pacing (short-horizon, purely local) are deliberately separate: a
//! rate-limit pause never touches the daily counter and a daily purge never
//! changes pacing. The counter triple (`remaining`, `resets_at`,
//! `hit_daily_limit`) is guarded by one async mutex per throttle, held only
//! for the duration of a mutation and never across the underlying request.

use crate::clock::{Clock, MILLIS_PER_DAY};
use crate::error::Rejection;
use crate::queue::{settled_job, TaskQueue};
use crate::sleeper::Sleeper;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Daily-counter state. `0 <= remaining <= max` outside a held guard.
struct QuotaState {
    remaining: u64,
    max: u64,
    /// Next UTC-midnight boundary (epoch milliseconds) at which `remaining`
    /// snaps back to `max`.
    resets_at: u64,
    /// Set once the remote service itself reports the daily quota
    /// exhausted. While set, compensation must not restore availability the
    /// vendor has revoked; only the daily reset clears it.
    hit_daily_limit: bool,
}

/// Live throttle state for one endpoint pattern.
///
/// Created once at rule registration and never destroyed, only mutated.
/// A throttle without a pacing rule executes submissions immediately; one
/// without a daily rule never rejects on quota.
pub struct Throttle {
    quota: Option<Mutex<QuotaState>>,
    queue: Option<TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("paced", &self.queue.is_some())
            .field("daily_rule", &self.quota.is_some())
            .finish()
    }
}

impl Throttle {
    /// Build a throttle. `dequeue_interval` is the pacing gap between
    /// successive dequeues (absent: execute immediately); `max_per_day` is
    /// the daily quota (absent: unlimited).
    pub(crate) fn new(
        dequeue_interval: Option<Duration>,
        max_per_day: Option<u64>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let quota = max_per_day.map(|max| {
            Mutex::new(QuotaState {
                remaining: max,
                max,
                resets_at: clock.next_utc_midnight(),
                hit_daily_limit: false,
            })
        });
        let queue = dequeue_interval.map(|interval| TaskQueue::new(interval, sleeper));
        Self { quota, queue, clock }
    }

    /// The shared fallback for endpoints with no registered rule.
    pub(crate) fn unlimited(clock: Arc<dyn Clock>) -> Self {
        Self { quota: None, queue: None, clock }
    }

    /// Whether a daily rule is configured for this throttle.
    pub fn has_daily_rule(&self) -> bool {
        self.quota.is_some()
    }

    /// The pacing queue, when a rate rule is configured.
    pub fn queue(&self) -> Option<&TaskQueue> {
        self.queue.as_ref()
    }

    /// Remaining daily tokens after a reset check; `None` when unlimited.
    pub async fn tokens_remaining(&self) -> Option<u64> {
        match &self.quota {
            None => None,
            Some(quota) => {
                let mut state = quota.lock().await;
                self.reset_if_due(&mut state);
                Some(state.remaining)
            }
        }
    }

    /// Next reset boundary (epoch ms); `None` when unlimited.
    pub async fn resets_at(&self) -> Option<u64> {
        match &self.quota {
            None => None,
            Some(quota) => {
                let mut state = quota.lock().await;
                self.reset_if_due(&mut state);
                Some(state.resets_at)
            }
        }
    }

    /// Whether the vendor has reported this quota exhausted.
    pub async fn vendor_reported_exhausted(&self) -> bool {
        match &self.quota {
            None => false,
            Some(quota) => {
                let mut state = quota.lock().await;
                self.reset_if_due(&mut state);
                state.hit_daily_limit
            }
        }
    }

    /// Consume one daily token, or fail with the current reset boundary if
    /// none remain. Always succeeds on unlimited throttles. This is the
    /// re-check performed inside a queue's dequeue turn, so two concurrent
    /// calls can never both consume the same last token.
    pub async fn take_token(&self) -> Result<(), Rejection> {
        let Some(quota) = &self.quota else { return Ok(()) };
        let mut state = quota.lock().await;
        self.reset_if_due(&mut state);
        if state.remaining == 0 {
            return Err(Rejection::DailyLimit { resets_at: state.resets_at });
        }
        state.remaining -= 1;
        Ok(())
    }

    /// Give back one daily token, clamped at the configured maximum. Used
    /// as compensation when a call the counter charged turns out not to
    /// have truly consumed quota. No-op on unlimited throttles and while
    /// `hit_daily_limit` is set: the vendor, not the local counter, owns
    /// truth at that point.
    pub async fn restore_token(&self) {
        let Some(quota) = &self.quota else { return };
        let mut state = quota.lock().await;
        self.reset_if_due(&mut state);
        if state.hit_daily_limit {
            return;
        }
        state.remaining = (state.remaining + 1).min(state.max);
    }

    /// Force the counter to zero and mark the vendor-reported exhaustion.
    /// Adopts `resets_at_hint` (epoch ms) when it is in the future, so the
    /// local boundary matches the service's suggested resume time.
    pub async fn empty_reservoir(&self, resets_at_hint: Option<u64>) {
        let Some(quota) = &self.quota else { return };
        let mut state = quota.lock().await;
        state.remaining = 0;
        state.hit_daily_limit = true;
        if let Some(hint) = resets_at_hint {
            if hint > self.clock.now_millis() {
                state.resets_at = hint;
            }
        }
        debug!(target: "quotagate::throttle", resets_at = state.resets_at, "reservoir emptied");
    }

    /// Submit a call through this throttle. Unpaced throttles execute
    /// immediately in call order; paced throttles enqueue and settle when
    /// the queue eventually runs the task.
    pub async fn submit<T, F, Fut>(
        &self,
        high_priority: bool,
        front: bool,
        f: F,
    ) -> Result<T, Rejection>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        match &self.queue {
            None => Ok(f().await),
            Some(queue) => {
                let (job, rx) = settled_job(f);
                queue.push(job, high_priority, front);
                match rx.await {
                    Ok(settled) => settled,
                    Err(_) => Err(Rejection::QueueClosed),
                }
            }
        }
    }

    /// Restore a stale counter before any read or mutation. Advances the
    /// boundary in whole-day steps until it is back in the future, so
    /// arbitrarily long idle periods are caught up in one call.
    fn reset_if_due(&self, state: &mut QuotaState) {
        let now = self.clock.now_millis();
        if now < state.resets_at {
            return;
        }
        state.remaining = state.max;
        state.hit_daily_limit = false;
        while state.resets_at <= now {
            state.resets_at += MILLIS_PER_DAY;
        }
    }
}
