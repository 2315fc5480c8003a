use crate::error::ErrorClass;
use crate::models::{ProviderMetricsSnapshot, ProviderName, ResponseTimeStats};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Upper bound on retained response-time samples.
const MAX_SAMPLES: usize = 1024;

#[derive(Debug)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cached_requests: u64,
    timeout_errors: u64,
    rate_limit_errors: u64,
    network_errors: u64,
    parse_errors: u64,
    circuit_opened: u64,
    circuit_closed: u64,
    samples: VecDeque<(Instant, Duration)>,
    window_start: DateTime<Utc>,
    last_success: Option<Instant>,
}

/// Per-provider request counters and response-time statistics over a
/// sliding window. Every attempt made by the resilience envelope is
/// recorded here.
pub struct MetricsRecorder {
    provider: ProviderName,
    window: Duration,
    inner: Mutex<MetricsInner>,
}

impl MetricsRecorder {
    #[must_use]
    pub fn new(provider: ProviderName, window: Duration) -> Self {
        Self {
            provider,
            window,
            inner: Mutex::new(MetricsInner {
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                cached_requests: 0,
                timeout_errors: 0,
                rate_limit_errors: 0,
                network_errors: 0,
                parse_errors: 0,
                circuit_opened: 0,
                circuit_closed: 0,
                samples: VecDeque::new(),
                window_start: Utc::now(),
                last_success: None,
            }),
        }
    }

    pub async fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.last_success = Some(Instant::now());
        Self::push_sample(&mut inner, duration, self.window);
    }

    pub async fn record_error(&self, class: ErrorClass, duration: Duration) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.failed_requests += 1;
        match class {
            ErrorClass::Timeout => inner.timeout_errors += 1,
            ErrorClass::RateLimit => inner.rate_limit_errors += 1,
            ErrorClass::Network => inner.network_errors += 1,
            ErrorClass::Parse => inner.parse_errors += 1,
            _ => {}
        }
        Self::push_sample(&mut inner, duration, self.window);
    }

    /// A response served from cache on this provider's behalf.
    pub async fn record_cached(&self) {
        let mut inner = self.inner.lock().await;
        inner.cached_requests += 1;
    }

    /// Upstream records discarded during parsing (a warning, not a failed
    /// request).
    pub async fn record_parse_warnings(&self, count: u32) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.parse_errors += u64::from(count);
    }

    /// Sync circuit transition counts from the breaker.
    pub async fn record_circuit_transitions(&self, opened: u64, closed: u64) {
        let mut inner = self.inner.lock().await;
        inner.circuit_opened = opened;
        inner.circuit_closed = closed;
    }

    /// Success rate over everything recorded, in [0, 1].
    pub async fn success_rate(&self) -> f64 {
        let inner = self.inner.lock().await;
        if inner.total_requests == 0 {
            1.0
        } else {
            inner.successful_requests as f64 / inner.total_requests as f64
        }
    }

    pub async fn avg_response_time_ms(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner, self.window);
        let stats = Self::stats_of(&inner.samples);
        stats.avg_ms
    }

    pub async fn snapshot(&self) -> ProviderMetricsSnapshot {
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner, self.window);
        ProviderMetricsSnapshot {
            provider: self.provider,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            cached_requests: inner.cached_requests,
            response_times: Self::stats_of(&inner.samples),
            timeout_errors: inner.timeout_errors,
            rate_limit_errors: inner.rate_limit_errors,
            network_errors: inner.network_errors,
            parse_errors: inner.parse_errors,
            circuit_opened: inner.circuit_opened,
            circuit_closed: inner.circuit_closed,
            window_start: inner.window_start,
            window_end: Utc::now(),
        }
    }

    fn push_sample(inner: &mut MetricsInner, duration: Duration, window: Duration) {
        inner.samples.push_back((Instant::now(), duration));
        if inner.samples.len() > MAX_SAMPLES {
            inner.samples.pop_front();
        }
        Self::prune(inner, window);
    }

    fn prune(inner: &mut MetricsInner, window: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats_of(samples: &VecDeque<(Instant, Duration)>) -> ResponseTimeStats {
        if samples.is_empty() {
            return ResponseTimeStats::default();
        }
        let mut millis: Vec<f64> = samples
            .iter()
            .map(|(_, d)| d.as_secs_f64() * 1000.0)
            .collect();
        millis.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let min_ms = millis[0];
        let max_ms = millis[millis.len() - 1];
        let avg_ms = millis.iter().sum::<f64>() / millis.len() as f64;
        // Nearest-rank p95.
        let rank = ((millis.len() as f64) * 0.95).ceil() as usize;
        let p95_ms = millis[rank.clamp(1, millis.len()) - 1];
        ResponseTimeStats {
            min_ms,
            avg_ms,
            max_ms,
            p95_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(ProviderName::Arxiv, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn counters_track_outcomes() {
        let metrics = recorder();
        metrics.record_success(Duration::from_millis(50)).await;
        metrics
            .record_error(ErrorClass::Timeout, Duration::from_millis(200))
            .await;
        metrics
            .record_error(ErrorClass::RateLimit, Duration::from_millis(1))
            .await;
        metrics.record_cached().await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 2);
        assert_eq!(snapshot.cached_requests, 1);
        assert_eq!(snapshot.timeout_errors, 1);
        assert_eq!(snapshot.rate_limit_errors, 1);
    }

    #[tokio::test]
    async fn p95_is_near_the_tail() {
        let metrics = recorder();
        for ms in 1..=100u64 {
            metrics.record_success(Duration::from_millis(ms)).await;
        }
        let stats = metrics.snapshot().await.response_times;
        assert_eq!(stats.min_ms as u64, 1);
        assert_eq!(stats.max_ms as u64, 100);
        assert_eq!(stats.p95_ms as u64, 95);
        assert!((stats.avg_ms - 50.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn success_rate_defaults_to_one() {
        let metrics = recorder();
        assert!((metrics.success_rate().await - 1.0).abs() < f64::EPSILON);
        metrics.record_success(Duration::from_millis(5)).await;
        metrics
            .record_error(ErrorClass::Network, Duration::from_millis(5))
            .await;
        assert!((metrics.success_rate().await - 0.5).abs() < f64::EPSILON);
    }
}
