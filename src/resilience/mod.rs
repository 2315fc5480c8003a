//! Resilience primitives wrapped around every provider call: token-bucket
//! rate limiting, circuit breaking, retry with backoff and response-time
//! metrics. The composition lives in `providers::resilient`.

pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use metrics::MetricsRecorder;
pub use rate_limiter::TokenBucketLimiter;
pub use retry::retry_with_settings;
