use crate::config::RetrySettings;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Execute an operation with retries and exponential backoff.
///
/// Only retryable error classes (timeouts, network failures, 5xx-like
/// upstream errors, rate limits carrying a retry window) are retried;
/// everything else surfaces immediately. `max_retries` counts additional
/// attempts after the first one.
pub async fn retry_with_settings<T, F, Fut>(
    operation: F,
    settings: &RetrySettings,
    operation_name: &str,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = operation().await;
        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= settings.max_retries {
                    if attempt > 0 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            %error,
                            "operation failed after retries"
                        );
                    }
                    return Err(error);
                }

                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| backoff_delay(attempt, settings));
                debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retrying after backoff"
                );

                tokio::select! {
                    () = cancel.cancelled() => return Err(error),
                    () = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with up to 10% jitter.
fn backoff_delay(attempt: u32, settings: &RetrySettings) -> Duration {
    let base_ms = settings.initial_delay_ms as f64;
    let exp_ms = base_ms * settings.multiplier.powi(attempt as i32);
    let capped_ms = exp_ms.min(settings.max_delay_ms as f64);

    use rand::Rng;
    let jitter_ms = rand::thread_rng().gen_range(0.0..=capped_ms * 0.1);
    Duration::from_millis((capped_ms + jitter_ms) as u64)
}
