use crate::config::CircuitSettings;
use crate::models::CircuitStateLabel;
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open { opened_at: Instant },
    /// Limited trial requests are admitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn label(&self) -> CircuitStateLabel {
        match self {
            Self::Closed => CircuitStateLabel::Closed,
            Self::Open { .. } => CircuitStateLabel::Open,
            Self::HalfOpen => CircuitStateLabel::HalfOpen,
        }
    }
}

#[derive(Debug, Default)]
struct CircuitCounters {
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    window_start: Option<Instant>,
    opened_transitions: u64,
    closed_transitions: u64,
}

/// Per-provider circuit breaker.
///
/// Closed trips to open when `failure_threshold` failures accumulate within
/// the failure window; open rejects everything until the recovery timeout,
/// then half-open admits at most `half_open_max_calls` trials and closes
/// after `success_threshold` consecutive successes, reopening on any
/// failure. The breaker observes a retried call as one logical outcome.
pub struct CircuitBreaker {
    provider: String,
    settings: CircuitSettings,
    state: RwLock<CircuitState>,
    counters: RwLock<CircuitCounters>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, settings: CircuitSettings) -> Self {
        Self {
            provider: provider.into(),
            settings,
            state: RwLock::new(CircuitState::Closed),
            counters: RwLock::new(CircuitCounters::default()),
        }
    }

    /// Execute an operation behind the breaker. The closure is not invoked
    /// when the circuit rejects the call.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.admit().await {
            return Err(Error::CircuitOpen {
                provider: self.provider.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success().await,
            Err(error) => {
                if error.counts_as_circuit_failure() {
                    self.on_failure().await;
                } else {
                    debug!(
                        provider = %self.provider,
                        class = %error.class(),
                        "error does not count against the circuit"
                    );
                }
            }
        }
        result
    }

    async fn admit(&self) -> bool {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;

        match &*state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= Duration::from_secs(self.settings.recovery_timeout_secs) {
                    *state = CircuitState::HalfOpen;
                    counters.success_count = 0;
                    counters.half_open_calls = 1;
                    info!(provider = %self.provider, "circuit transitioning open -> half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if counters.half_open_calls < self.settings.half_open_max_calls {
                    counters.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;

        match &*state {
            CircuitState::Closed => {
                counters.failure_count = 0;
                counters.window_start = None;
            }
            CircuitState::HalfOpen => {
                counters.success_count += 1;
                if counters.success_count >= self.settings.success_threshold {
                    *state = CircuitState::Closed;
                    counters.failure_count = 0;
                    counters.success_count = 0;
                    counters.half_open_calls = 0;
                    counters.window_start = None;
                    counters.closed_transitions += 1;
                    info!(provider = %self.provider, "circuit transitioning half-open -> closed");
                }
            }
            CircuitState::Open { .. } => {
                // A late success from before the trip; leave the state alone.
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;

        match &*state {
            CircuitState::Closed => {
                let window = Duration::from_secs(self.settings.failure_window_secs);
                let now = Instant::now();
                match counters.window_start {
                    Some(start) if now.duration_since(start) <= window => {}
                    _ => {
                        counters.window_start = Some(now);
                        counters.failure_count = 0;
                    }
                }
                counters.failure_count += 1;
                if counters.failure_count >= self.settings.failure_threshold {
                    *state = CircuitState::Open { opened_at: now };
                    counters.opened_transitions += 1;
                    warn!(
                        provider = %self.provider,
                        failures = counters.failure_count,
                        "circuit opening"
                    );
                }
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                counters.success_count = 0;
                counters.half_open_calls = 0;
                counters.opened_transitions += 1;
                warn!(provider = %self.provider, "circuit reopening from half-open");
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.clone()
    }

    pub async fn transition_counts(&self) -> (u64, u64) {
        let counters = self.counters.read().await;
        (counters.opened_transitions, counters.closed_transitions)
    }

    /// Administrative: trip the circuit open.
    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;
        if !matches!(&*state, CircuitState::Open { .. }) {
            counters.opened_transitions += 1;
        }
        *state = CircuitState::Open {
            opened_at: Instant::now(),
        };
        warn!(provider = %self.provider, "circuit forced open");
    }

    /// Administrative: close the circuit.
    pub async fn force_close(&self) {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;
        if !matches!(&*state, CircuitState::Closed) {
            counters.closed_transitions += 1;
        }
        *state = CircuitState::Closed;
        counters.failure_count = 0;
        counters.success_count = 0;
        counters.half_open_calls = 0;
        counters.window_start = None;
        info!(provider = %self.provider, "circuit forced closed");
    }

    /// Administrative: reset to closed with all counters cleared.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let mut counters = self.counters.write().await;
        *state = CircuitState::Closed;
        *counters = CircuitCounters::default();
        info!(provider = %self.provider, "circuit reset");
    }
}
