#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Admission control for calls to a remote, rate-limited HTTP API: decide
//! per logical endpoint whether a call executes immediately, waits in a
//! paced queue, or is rejected.
//!
//! ## Features
//!
//! - **Per-endpoint throttles** pairing an interval-paced priority queue
//!   with a daily token counter that resets at UTC midnight
//! - **Path-template rules** (`/meetings/{meetingId}`) compiled once at
//!   registration; unmatched endpoints share one unlimited throttle
//! - **Backpressure feedback**: vendor 429s pause queues, compensate
//!   miscounted quota, and resubmit the failed call at the front of the line
//! - **Daily purges**: a vendor-reported daily limit fails every queued
//!   call for that endpoint and pins the local counter at zero
//! - **Injectable clock and sleeper** for fast, deterministic tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quotagate::{
//!     AdmissionController, ApiRequest, ApiResponse, Headers, RequestExecutor, Rule,
//!     ThrottleRegistry,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct MyTransport;
//!
//! #[async_trait::async_trait]
//! impl RequestExecutor for MyTransport {
//!     type Error = std::io::Error;
//!
//!     async fn execute(&self, _request: &ApiRequest) -> Result<ApiResponse, Self::Error> {
//!         // Perform the HTTP call here.
//!         Ok(ApiResponse { status: 200, headers: Headers::new(), body: serde_json::json!({}) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ThrottleRegistry::new());
//!     registry.register(
//!         Rule::builder("GET", "/users/{userId}/meetings")
//!             .max_per_interval(10, Duration::from_secs(1))
//!             .max_per_day(1_000)
//!             .build()?,
//!     )?;
//!
//!     let controller = AdmissionController::new(registry, Arc::new(MyTransport));
//!     let response = controller
//!         .call("GET", "/users/42/meetings", serde_json::json!({}), false)
//!         .await?;
//!     println!("status: {}", response.status);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod controller;
pub mod error;
pub mod jitter;
pub mod queue;
pub mod registry;
pub mod sleeper;
pub mod throttle;

// Re-exports
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{
    AdmissionController, ApiRequest, ApiResponse, Headers, RequestExecutor, SignalConfig,
};
pub use error::{ConfigError, Rejection, ThrottleError};
pub use jitter::Jitter;
pub use queue::TaskQueue;
pub use registry::{RateRule, Rule, RuleBuilder, RuleConfig, ThrottleRegistry};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use throttle::Throttle;
