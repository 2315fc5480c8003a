use super::traits::{ProviderAdapter, ProviderQuery, ProviderSearchResult, SearchContext};
use crate::config::ProviderSettings;
use crate::models::{Paper, ProviderMetricsSnapshot, ProviderName, ProviderStatus};
use crate::resilience::{retry_with_settings, CircuitBreaker, MetricsRecorder, TokenBucketLimiter};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sliding window for response-time statistics.
const METRICS_WINDOW: Duration = Duration::from_secs(300);

/// One provider wrapped in its resilience envelope: rate limiter, circuit
/// breaker, retry and metrics. The adapter itself stays stateless; this
/// wrapper owns the mutable triple.
///
/// Call order is limiter first (exhaustion never reaches upstream), then
/// the breaker around the whole retry loop, so the breaker observes a
/// retried call as a single logical outcome.
pub struct ResilientProvider {
    adapter: Arc<dyn ProviderAdapter>,
    settings: RwLock<ProviderSettings>,
    limiter: RwLock<Arc<TokenBucketLimiter>>,
    breaker: Arc<CircuitBreaker>,
    metrics: MetricsRecorder,
    enabled: AtomicBool,
    healthy: AtomicBool,
    last_check: RwLock<DateTime<Utc>>,
}

impl ResilientProvider {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, settings: ProviderSettings) -> Self {
        let name = adapter.name();
        Self {
            limiter: RwLock::new(Arc::new(TokenBucketLimiter::new(
                name.as_str(),
                settings.rate.clone(),
            ))),
            breaker: Arc::new(CircuitBreaker::new(name.as_str(), settings.circuit.clone())),
            metrics: MetricsRecorder::new(name, METRICS_WINDOW),
            enabled: AtomicBool::new(settings.enabled),
            healthy: AtomicBool::new(true),
            last_check: RwLock::new(Utc::now()),
            settings: RwLock::new(settings),
            adapter,
        }
    }

    #[must_use]
    pub fn name(&self) -> ProviderName {
        self.adapter.name()
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Provider timeout from current settings.
    pub async fn timeout(&self) -> Duration {
        self.settings.read().await.timeout()
    }

    /// Envelope-wrapped search.
    pub async fn search(
        &self,
        query: &ProviderQuery,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProviderSearchResult> {
        let settings = self.settings.read().await.clone();
        let context = SearchContext::with_timeout(deadline.min(settings.timeout()));

        self.acquire_slot(cancel).await?;

        let adapter = self.adapter.clone();
        let metrics = &self.metrics;
        let operation = format!("{}.search", self.name());
        let result = self
            .breaker
            .call(|| {
                retry_with_settings(
                    || async {
                        let started = Instant::now();
                        let outcome = adapter.search(query, &context).await;
                        match &outcome {
                            Ok(result) => {
                                metrics.record_success(started.elapsed()).await;
                                metrics.record_parse_warnings(result.discarded).await;
                            }
                            Err(error) => {
                                metrics
                                    .record_error(error.class(), started.elapsed())
                                    .await;
                            }
                        }
                        outcome
                    },
                    &settings.retry,
                    &operation,
                    cancel,
                )
            })
            .await;

        self.sync_circuit_metrics().await;
        result
    }

    /// Envelope-wrapped single-paper lookup.
    pub async fn get_paper(
        &self,
        source_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Paper> {
        let settings = self.settings.read().await.clone();
        let context = SearchContext::with_timeout(deadline.min(settings.timeout()));

        self.acquire_slot(cancel).await?;

        let adapter = self.adapter.clone();
        let metrics = &self.metrics;
        let operation = format!("{}.get_paper", self.name());
        let result = self
            .breaker
            .call(|| {
                retry_with_settings(
                    || async {
                        let started = Instant::now();
                        let outcome = adapter.get_paper(source_id, &context).await;
                        match &outcome {
                            Ok(_) => metrics.record_success(started.elapsed()).await,
                            Err(error) => {
                                metrics
                                    .record_error(error.class(), started.elapsed())
                                    .await;
                            }
                        }
                        outcome
                    },
                    &settings.retry,
                    &operation,
                    cancel,
                )
            })
            .await;

        self.sync_circuit_metrics().await;
        result
    }

    /// Probe the upstream and update the healthy flag.
    pub async fn health_check(&self) -> Result<()> {
        let timeout = self.timeout().await;
        let context = SearchContext::with_timeout(timeout);
        let outcome = self.adapter.health_check(&context).await;
        self.healthy.store(outcome.is_ok(), Ordering::Relaxed);
        *self.last_check.write().await = Utc::now();
        outcome
    }

    /// Apply new settings to the adapter and rebuild the limiter and
    /// breaker with the new thresholds.
    pub async fn configure(&self, settings: ProviderSettings) -> Result<()> {
        self.adapter.validate_config(&settings)?;
        self.adapter.configure(settings.clone()).await?;

        *self.limiter.write().await = Arc::new(TokenBucketLimiter::new(
            self.name().as_str(),
            settings.rate.clone(),
        ));
        self.breaker.reset().await;
        self.set_enabled(settings.enabled);
        *self.settings.write().await = settings;
        debug!(provider = %self.name(), "provider reconfigured");
        Ok(())
    }

    pub async fn status(&self) -> ProviderStatus {
        let limiter = self.limiter.read().await.clone();
        ProviderStatus {
            name: self.name(),
            enabled: self.is_enabled(),
            healthy: self.healthy.load(Ordering::Relaxed),
            circuit_state: self.breaker.state().await.label(),
            rate_limited: limiter.is_exhausted().await,
            avg_response_time_ms: self.metrics.avg_response_time_ms().await,
            success_rate: self.metrics.success_rate().await,
            last_check: *self.last_check.read().await,
        }
    }

    pub async fn metrics_snapshot(&self) -> ProviderMetricsSnapshot {
        self.sync_circuit_metrics().await;
        self.metrics.snapshot().await
    }

    /// Count a cache-served response against this provider.
    pub async fn record_cached(&self) {
        self.metrics.record_cached().await;
    }

    /// Administrative circuit transitions.
    pub async fn force_circuit_open(&self) {
        self.breaker.force_open().await;
        self.sync_circuit_metrics().await;
    }

    pub async fn force_circuit_close(&self) {
        self.breaker.force_close().await;
        self.sync_circuit_metrics().await;
    }

    pub async fn reset_circuit(&self) {
        self.breaker.reset().await;
        self.sync_circuit_metrics().await;
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Result<()> {
        let limiter = self.limiter.read().await.clone();
        match limiter.acquire(cancel).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if matches!(error, Error::RateLimit { .. }) {
                    self.metrics
                        .record_error(crate::error::ErrorClass::RateLimit, Duration::ZERO)
                        .await;
                }
                Err(error)
            }
        }
    }

    async fn sync_circuit_metrics(&self) {
        let (opened, closed) = self.breaker.transition_counts().await;
        self.metrics.record_circuit_transitions(opened, closed).await;
    }
}
