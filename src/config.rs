//! Layered configuration: built-in defaults, an optional TOML file, then
//! `SCHOLAR_`-prefixed environment variables (`SCHOLAR_SEARCH__MAX_CONCURRENCY=8`).

use crate::models::ProviderName;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the federated search service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchSettings,
    pub providers: ProvidersSettings,
    pub bus: BusSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Global bound on concurrent provider calls across requests.
    pub max_concurrency: usize,
    /// Hard ceiling on one orchestration, seconds.
    pub request_timeout_secs: u64,
    /// TTL for cached search responses, seconds.
    pub cache_ttl_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            request_timeout_secs: 30,
            cache_ttl_secs: 3600,
        }
    }
}

impl SearchSettings {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Per-provider adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    /// Override of the adapter's default endpoint, mainly for tests.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub rate: RateLimitSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            timeout_secs: 30,
            rate: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
        }
    }
}

impl ProviderSettings {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Token-bucket limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    /// How long a denied caller is told to back off.
    pub backoff_secs: u64,
    /// Wait for a token instead of failing with RateLimit.
    pub wait_for_slot: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            requests_per_minute: 60,
            burst_size: 5,
            backoff_secs: 2,
            wait_for_slot: false,
        }
    }
}

/// Retry/backoff settings for the resilience envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            failure_window_secs: 60,
            recovery_timeout_secs: 30,
            half_open_max_calls: 3,
        }
    }
}

/// Settings for all four upstream providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    pub arxiv: ProviderSettings,
    pub semantic_scholar: ProviderSettings,
    pub exa: ProviderSettings,
    pub tavily: ProviderSettings,
}

impl Default for ProvidersSettings {
    fn default() -> Self {
        // arXiv asks for 3-second spacing between requests.
        let arxiv = ProviderSettings {
            rate: RateLimitSettings {
                requests_per_second: 1,
                requests_per_minute: 20,
                burst_size: 2,
                ..RateLimitSettings::default()
            },
            ..ProviderSettings::default()
        };
        // The web-search providers need keys and are disabled until one is set.
        let exa = ProviderSettings {
            enabled: false,
            ..ProviderSettings::default()
        };
        let tavily = ProviderSettings {
            enabled: false,
            ..ProviderSettings::default()
        };
        Self {
            arxiv,
            semantic_scholar: ProviderSettings::default(),
            exa,
            tavily,
        }
    }
}

impl ProvidersSettings {
    #[must_use]
    pub const fn get(&self, provider: ProviderName) -> &ProviderSettings {
        match provider {
            ProviderName::Arxiv => &self.arxiv,
            ProviderName::SemanticScholar => &self.semantic_scholar,
            ProviderName::Exa => &self.exa,
            ProviderName::Tavily => &self.tavily,
        }
    }

    pub fn get_mut(&mut self, provider: ProviderName) -> &mut ProviderSettings {
        match provider {
            ProviderName::Arxiv => &mut self.arxiv,
            ProviderName::SemanticScholar => &mut self.semantic_scholar,
            ProviderName::Exa => &mut self.exa,
            ProviderName::Tavily => &mut self.tavily,
        }
    }
}

/// Event bus client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub enabled: bool,
    /// Timeout for request/reply round trips, seconds.
    pub request_timeout_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            request_timeout_secs: 5,
        }
    }
}

/// Embedded broker settings; the broker only runs when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Directory for persistent streams; memory-only when unset.
    pub store_dir: Option<PathBuf>,
    /// Caps parseable as `<n>{B|KB|MB|GB|TB}`.
    pub max_memory: Option<String>,
    pub max_storage: Option<String>,
    pub tls: Option<BrokerTlsSettings>,
    pub cluster: Option<BrokerClusterSettings>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 4222,
            store_dir: None,
            max_memory: None,
            max_storage: None,
            tls: None,
            cluster: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// When set, clients must present certificates signed by this CA.
    pub client_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerClusterSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub routes: Vec<String>,
}

/// Search cache and history storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Sled database directory; an in-memory tree when unset (tests).
    pub path: Option<PathBuf>,
    /// Interval between expired-entry sweeps, seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: None,
            cleanup_interval_secs: 300,
        }
    }
}

/// Programmatic overrides applied after file and environment sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_concurrency: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub storage_path: Option<PathBuf>,
    pub broker_enabled: Option<bool>,
    pub broker_store_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from defaults, an optional file and environment.
    pub fn load(file: Option<&std::path::Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SCHOLAR")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(max_concurrency) = overrides.max_concurrency {
            self.search.max_concurrency = max_concurrency;
        }
        if let Some(timeout) = overrides.request_timeout_secs {
            self.search.request_timeout_secs = timeout;
        }
        if let Some(ttl) = overrides.cache_ttl_secs {
            self.search.cache_ttl_secs = ttl;
        }
        if let Some(path) = &overrides.storage_path {
            self.storage.path = Some(path.clone());
        }
        if let Some(enabled) = overrides.broker_enabled {
            self.broker.enabled = enabled;
        }
        if let Some(dir) = &overrides.broker_store_dir {
            self.broker.store_dir = Some(dir.clone());
        }
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.search.max_concurrency == 0 {
            return Err(Error::Validation {
                field: "search.max_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.search.request_timeout_secs == 0 {
            return Err(Error::Validation {
                field: "search.request_timeout_secs".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        for provider in ProviderName::ALL {
            let settings = self.providers.get(provider);
            if settings.timeout_secs == 0 {
                return Err(Error::Validation {
                    field: format!("providers.{provider}.timeout_secs"),
                    reason: "must be at least 1 second".to_string(),
                });
            }
            if settings.rate.requests_per_second == 0 || settings.rate.burst_size == 0 {
                return Err(Error::Validation {
                    field: format!("providers.{provider}.rate"),
                    reason: "requests_per_second and burst_size must be positive".to_string(),
                });
            }
            if settings.circuit.failure_threshold == 0 || settings.circuit.success_threshold == 0 {
                return Err(Error::Validation {
                    field: format!("providers.{provider}.circuit"),
                    reason: "thresholds must be positive".to_string(),
                });
            }
        }
        if self.broker.enabled && self.broker.port == 0 {
            return Err(Error::Validation {
                field: "broker.port".to_string(),
                reason: "port must be non-zero when the broker is enabled".to_string(),
            });
        }
        if let Some(tls) = &self.broker.tls {
            if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                return Err(Error::Validation {
                    field: "broker.tls".to_string(),
                    reason: "cert_file and key_file are both required".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Providers currently enabled, in stable order.
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|p| self.providers.get(*p).enabled)
            .collect()
    }
}
