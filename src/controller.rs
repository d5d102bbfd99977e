//! Admission control orchestration
//!
//! For each outgoing call: resolve the throttle, fail fast on an exhausted
//! daily quota, submit the attempt through the throttle's queue (the queued
//! job re-checks and decrements the counter before invoking the executor),
//! then interpret the HTTP result. A transient rate signal pauses the queue
//! within the dequeue turn itself, compensates the consumed token, and
//! resubmits the same call at the front; a daily signal purges the queue
//! and empties the reservoir; other failures stay local to the call.

use crate::backoff::Backoff;
use crate::clock::{Clock, SystemClock};
use crate::error::{Rejection, ThrottleError};
use crate::jitter::Jitter;
use crate::registry::ThrottleRegistry;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::throttle::Throttle;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Response headers with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// The call handed to the transport layer.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub params: Value,
}

/// What the transport layer hands back. The engine only reads the status
/// and the rate-limit headers; the body passes through opaquely.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request-execution function supplied by the transport layer. The
/// engine never performs network I/O itself; transport-level retries and
/// authentication are the implementor's concern.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, Self::Error>;
}

/// How the remote service's backpressure signals are recognized and
/// answered.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Header distinguishing "daily" from transient rate exhaustion on a
    /// 429. Compared case-insensitively.
    pub limit_type_header: String,
    /// Value of `limit_type_header` marking daily exhaustion. Any other
    /// value (or a missing header) reads as a transient rate signal; a
    /// daily misread would wrongly purge a whole queue.
    pub daily_value: String,
    /// Header carrying the service's suggested wait, in delta seconds.
    pub retry_hint_header: String,
    /// Pause length per consecutive 429 when no usable hint arrives.
    pub fallback_backoff: Backoff,
    /// Randomization of fallback pauses. Hinted pauses are never jittered.
    pub jitter: Jitter,
    /// Retries allowed per call while the service keeps signalling rate
    /// limiting; past this the call fails with `RateLimitExhausted`.
    pub max_rate_limit_retries: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            limit_type_header: "x-ratelimit-type".to_string(),
            daily_value: "daily".to_string(),
            retry_hint_header: "retry-after".to_string(),
            fallback_backoff: Backoff::default(),
            jitter: Jitter::Full,
            max_rate_limit_retries: 5,
        }
    }
}

/// Interpretation of one executed attempt.
enum Outcome {
    Success,
    RetryableRateLimit { retry_after: Option<Duration> },
    FatalDailyLimit { retry_after: Option<Duration> },
    OtherFailure,
}

fn classify(signals: &SignalConfig, response: &ApiResponse) -> Outcome {
    if response.is_success() {
        return Outcome::Success;
    }
    if response.status == 429 {
        let retry_after =
            response.headers.get(&signals.retry_hint_header).and_then(parse_retry_after);
        let daily = response
            .headers
            .get(&signals.limit_type_header)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(&signals.daily_value));
        return if daily {
            Outcome::FatalDailyLimit { retry_after }
        } else {
            Outcome::RetryableRateLimit { retry_after }
        };
    }
    Outcome::OtherFailure
}

/// Pause length for consecutive rate-limit attempt `attempt`: the service's
/// hint verbatim when given, the jittered fallback otherwise.
fn pause_delay(signals: &SignalConfig, attempt: usize, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => hint,
        None => signals.jitter.apply(signals.fallback_backoff.delay(attempt)),
    }
}

/// What a queued attempt can fail with before interpretation.
enum AttemptError<E> {
    Rejected(Rejection),
    Transport(E),
}

/// Orchestrates calls through the registry's throttles.
pub struct AdmissionController<X> {
    registry: Arc<ThrottleRegistry>,
    executor: Arc<X>,
    signals: SignalConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<X> std::fmt::Debug for AdmissionController<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController").field("registry", &self.registry).finish()
    }
}

impl<X: RequestExecutor> AdmissionController<X> {
    pub fn new(registry: Arc<ThrottleRegistry>, executor: Arc<X>) -> Self {
        Self::with_parts(
            registry,
            executor,
            SignalConfig::default(),
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
        )
    }

    /// Construct with explicit signal handling and time sources.
    pub fn with_parts(
        registry: Arc<ThrottleRegistry>,
        executor: Arc<X>,
        signals: SignalConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { registry, executor, signals, clock, sleeper }
    }

    pub fn registry(&self) -> &Arc<ThrottleRegistry> {
        &self.registry
    }

    /// Issue a call through admission control.
    ///
    /// Returns the successful response, or a [`ThrottleError`] once the
    /// call reaches a terminal state. Transient rate limiting is retried
    /// internally and only surfaces as `RateLimitExhausted` when the retry
    /// budget runs out.
    pub async fn call(
        &self,
        method: &str,
        path: &str,
        params: Value,
        high_priority: bool,
    ) -> Result<ApiResponse, ThrottleError<X::Error>> {
        let throttle = self.registry.lookup(method, path);

        // Don't waste a pacing slot on a call the counter already dooms.
        if throttle.tokens_remaining().await == Some(0) {
            let resets_at = throttle.resets_at().await.unwrap_or_default();
            return Err(ThrottleError::DailyLimit { resets_at });
        }

        let request = Arc::new(ApiRequest {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            params,
        });

        let mut rate_limited_attempts = 0usize;
        let mut high = high_priority;
        let mut front = false;
        loop {
            let response =
                self.attempt(&throttle, &request, high, front, rate_limited_attempts + 1).await?;
            match classify(&self.signals, &response) {
                Outcome::Success => return Ok(response),
                Outcome::OtherFailure => {
                    return Err(ThrottleError::OtherStatus {
                        status: response.status,
                        body: response.body,
                    });
                }
                Outcome::FatalDailyLimit { retry_after } => {
                    return Err(self.handle_daily_signal(&throttle, &request, retry_after).await);
                }
                Outcome::RetryableRateLimit { retry_after } => {
                    // The consumed token should not count against a call
                    // that never truly succeeded.
                    throttle.restore_token().await;
                    rate_limited_attempts += 1;
                    if rate_limited_attempts > self.signals.max_rate_limit_retries {
                        return Err(ThrottleError::RateLimitExhausted {
                            attempts: rate_limited_attempts,
                        });
                    }
                    debug!(
                        target: "quotagate::controller",
                        method = %request.method,
                        path = %request.path,
                        attempt = rate_limited_attempts,
                        "rate limited; resubmitting at the front"
                    );
                    if throttle.queue().is_none() {
                        // Unpaced throttle: nothing to pause, so wait here.
                        // Paced throttles were already paused inside the
                        // dequeue turn, before the attempt settled.
                        let delay = pause_delay(&self.signals, rate_limited_attempts, retry_after);
                        self.sleeper.sleep(delay).await;
                    }
                    // Front of the highest-priority slot: the very next
                    // thing executed once the pause lifts.
                    high = true;
                    front = true;
                }
            }
        }
    }

    /// Run one attempt through the throttle. The queued job re-checks the
    /// daily counter and consumes a token inside the dequeue turn, then
    /// invokes the executor.
    ///
    /// On a transient rate signal the job pauses the queue itself, before
    /// its settlement reaches the submitter. Pausing only after the
    /// controller resumes would leave a window in which the next pacing
    /// tick dequeues an unrelated call ahead of the retry.
    async fn attempt(
        &self,
        throttle: &Arc<Throttle>,
        request: &Arc<ApiRequest>,
        high_priority: bool,
        front: bool,
        attempt_number: usize,
    ) -> Result<ApiResponse, ThrottleError<X::Error>> {
        let job_throttle = throttle.clone();
        let executor = self.executor.clone();
        let job_request = request.clone();
        let signals = self.signals.clone();
        let settled = throttle
            .submit(high_priority, front, move || async move {
                if let Err(rejection) = job_throttle.take_token().await {
                    return Err(AttemptError::Rejected(rejection));
                }
                let response =
                    executor.execute(&job_request).await.map_err(AttemptError::Transport)?;
                if let Outcome::RetryableRateLimit { retry_after } = classify(&signals, &response) {
                    if let Some(queue) = job_throttle.queue() {
                        let delay = pause_delay(&signals, attempt_number, retry_after);
                        debug!(
                            target: "quotagate::controller",
                            method = %job_request.method,
                            path = %job_request.path,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited; pausing the queue"
                        );
                        queue.pause_until(Instant::now() + delay);
                    }
                }
                Ok(response)
            })
            .await;
        match settled {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(AttemptError::Rejected(rejection))) => Err(rejection.into()),
            Ok(Err(AttemptError::Transport(e))) => Err(ThrottleError::Inner(e)),
            Err(rejection) => Err(rejection.into()),
        }
    }

    /// The vendor reported the daily quota exhausted. Purge the queue,
    /// empty the reservoir, and adopt the service's reset hint, unless no
    /// daily rule exists here, in which case only this call fails.
    async fn handle_daily_signal(
        &self,
        throttle: &Arc<Throttle>,
        request: &Arc<ApiRequest>,
        retry_after: Option<Duration>,
    ) -> ThrottleError<X::Error> {
        if !throttle.has_daily_rule() {
            warn!(
                target: "quotagate::controller",
                method = %request.method,
                path = %request.path,
                "daily limit reported for an endpoint with no daily rule"
            );
            return ThrottleError::UnexpectedDailySignal {
                method: request.method.clone(),
                path: request.path.clone(),
            };
        }
        let hint = retry_after.map(|d| {
            self.clock.now_millis().saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        });
        throttle.empty_reservoir(hint).await;
        let resets_at = throttle.resets_at().await.unwrap_or_default();
        warn!(
            target: "quotagate::controller",
            method = %request.method,
            path = %request.path,
            resets_at,
            "daily limit reached; purging queued calls"
        );
        if let Some(queue) = throttle.queue() {
            queue.reject_all(Rejection::DailyLimit { resets_at });
        }
        ThrottleError::DailyLimit { resets_at }
    }
}

/// Parse a retry hint in delta seconds; garbage reads as "no hint".
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
