use crate::config::RateLimitSettings;
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Token-bucket rate limiter with both per-second and per-minute ceilings.
///
/// The bucket holds at most `burst_size` tokens and refills at
/// `requests_per_second`. A separate one-minute window enforces
/// `requests_per_minute`. Exhaustion either fails fast with a RateLimit
/// error or waits for a token, depending on `wait_for_slot`.
pub struct TokenBucketLimiter {
    provider: String,
    settings: RateLimitSettings,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    minute_start: Instant,
    minute_count: u32,
}

enum Decision {
    Granted,
    Denied { retry_after: Duration },
}

impl TokenBucketLimiter {
    pub fn new(provider: impl Into<String>, settings: RateLimitSettings) -> Self {
        let now = Instant::now();
        Self {
            provider: provider.into(),
            state: Mutex::new(BucketState {
                tokens: f64::from(settings.burst_size),
                last_refill: now,
                minute_start: now,
                minute_count: 0,
            }),
            settings,
        }
    }

    /// Take a token or fail with RateLimit without calling upstream.
    pub async fn try_acquire(&self) -> Result<()> {
        match self.decide().await {
            Decision::Granted => Ok(()),
            Decision::Denied { retry_after } => {
                debug!(
                    provider = %self.provider,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limiter denied request"
                );
                Err(Error::RateLimit {
                    provider: self.provider.clone(),
                    retry_after: Some(retry_after),
                })
            }
        }
    }

    /// Take a token, waiting for refill when configured to; observes the
    /// cancellation token while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.settings.wait_for_slot {
            return self.try_acquire().await;
        }
        loop {
            match self.decide().await {
                Decision::Granted => return Ok(()),
                Decision::Denied { retry_after } => {
                    let wait = retry_after.min(Duration::from_secs(self.settings.backoff_secs));
                    debug!(
                        provider = %self.provider,
                        wait_ms = wait.as_millis() as u64,
                        "rate limiter waiting for a slot"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(Error::Timeout {
                                operation: format!("rate limit wait for {}", self.provider),
                                timeout: wait,
                            });
                        }
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Whether a request made right now would be denied.
    pub async fn is_exhausted(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens < 1.0 || state.minute_count >= self.settings.requests_per_minute
    }

    async fn decide(&self) -> Decision {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if self.settings.requests_per_minute > 0
            && state.minute_count >= self.settings.requests_per_minute
        {
            let elapsed = state.minute_start.elapsed();
            let retry_after = Duration::from_secs(60).saturating_sub(elapsed);
            return Decision::Denied { retry_after };
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.minute_count += 1;
            Decision::Granted
        } else {
            let deficit = 1.0 - state.tokens;
            let per_token = 1.0 / f64::from(self.settings.requests_per_second.max(1));
            let retry_after = Duration::from_secs_f64(deficit * per_token);
            Decision::Denied { retry_after }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let refill = elapsed.as_secs_f64() * f64::from(self.settings.requests_per_second);
        state.tokens = (state.tokens + refill).min(f64::from(self.settings.burst_size));
        state.last_refill = now;

        if now.duration_since(state.minute_start) >= Duration::from_secs(60) {
            state.minute_start = now;
            state.minute_count = 0;
        }
    }
}
