use crate::error::{ErrorClass, ErrorDetail};
use crate::models::paper::{Paper, ProviderName};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum free-text query length accepted by the orchestrator.
pub const MAX_QUERY_LENGTH: usize = 1000;
/// Result-count bounds for a single request.
pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 100;
pub const DEFAULT_LIMIT: u32 = 20;

/// How results from multiple providers are folded into one list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Deduplicate and merge records across providers (default).
    #[default]
    Merge,
    /// Results from the first provider in selection order that succeeded.
    First,
    /// Results from the provider that answered first.
    Fastest,
    /// Merged results ranked strictly by quality score.
    BestQuality,
    /// Interleave provider result lists.
    RoundRobin,
}

/// Sort key for the merged result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    PublishedDate,
    CitationCount,
    Title,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Structured filters carried alongside the free-text query. Providers drop
/// the ones their capabilities do not cover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_citations: Option<u32>,
}

impl SearchFilters {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.journal.is_none()
            && self.category.is_none()
            && self.keywords.is_empty()
            && self.min_citations.is_none()
    }

    /// Stable key/value pairs, sorted by key, for fingerprinting.
    #[must_use]
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(author) = &self.author {
            pairs.push(("author".to_string(), author.to_lowercase()));
        }
        if let Some(journal) = &self.journal {
            pairs.push(("journal".to_string(), journal.to_lowercase()));
        }
        if let Some(category) = &self.category {
            pairs.push(("category".to_string(), category.to_lowercase()));
        }
        if !self.keywords.is_empty() {
            let mut keywords: Vec<String> =
                self.keywords.iter().map(|k| k.to_lowercase()).collect();
            keywords.sort();
            pairs.push(("keywords".to_string(), keywords.join(",")));
        }
        if let Some(min) = self.min_citations {
            pairs.push(("min_citations".to_string(), min.to_string()));
        }
        pairs.sort();
        pairs
    }
}

/// A single federated search request, stack-scoped to one orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchRequest {
    #[serde(default)]
    pub request_id: String,
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    /// Explicit provider subset; all enabled providers when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub strategy: AggregationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

const fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            request_id: generate_request_id(),
            query: query.into(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            providers: None,
            date_from: None,
            date_to: None,
            filters: SearchFilters::default(),
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            strategy: AggregationStrategy::default(),
            user_id: None,
            client_ip: None,
            user_agent: None,
        }
    }

    /// Validate the request, assigning a request id when absent.
    pub fn validate(&mut self) -> Result<()> {
        if self.request_id.is_empty() {
            self.request_id = generate_request_id();
        }
        let query = self.query.trim();
        if query.is_empty() {
            return Err(Error::Validation {
                field: "query".to_string(),
                reason: "query cannot be empty".to_string(),
            });
        }
        if query.chars().count() > MAX_QUERY_LENGTH {
            return Err(Error::Validation {
                field: "query".to_string(),
                reason: format!("query exceeds {MAX_QUERY_LENGTH} characters"),
            });
        }
        if self.limit < MIN_LIMIT || self.limit > MAX_LIMIT {
            return Err(Error::Validation {
                field: "limit".to_string(),
                reason: format!("limit must be within [{MIN_LIMIT}, {MAX_LIMIT}]"),
            });
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(Error::Validation {
                    field: "date_range".to_string(),
                    reason: "date_from must not be after date_to".to_string(),
                });
            }
        }
        if let Some(providers) = &self.providers {
            if providers.is_empty() {
                return Err(Error::Validation {
                    field: "providers".to_string(),
                    reason: "provider subset cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Request ids follow `req_<ns>_<8-hex>`, the format echoed by the API layer.
#[must_use]
pub fn generate_request_id() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("req_{nanos}_{suffix}")
}

/// Per-provider failure surfaced in a partial or total failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: ProviderName,
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderFailure {
    #[must_use]
    pub fn from_detail(provider: ProviderName, detail: &ErrorDetail) -> Self {
        Self {
            provider,
            class: detail.class,
            message: detail.message.clone(),
        }
    }
}

/// The merged, ranked result of one federated search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub request_id: String,
    pub papers: Vec<Paper>,
    /// Estimated total across providers; pagination must not rely on it.
    pub total_count: u64,
    pub result_count: u32,
    pub providers_used: Vec<ProviderName>,
    pub providers_failed: Vec<ProviderName>,
    pub duration_ms: u64,
    pub strategy: AggregationStrategy,
    #[serde(default)]
    pub cache_hit: bool,
    /// Times this cached envelope has been served, counting this response.
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub partial_failure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProviderFailure>,
}

/// Circuit state in its serializable form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateLabel {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time status of one provider, as reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: ProviderName,
    pub enabled: bool,
    pub healthy: bool,
    pub circuit_state: CircuitStateLabel,
    pub rate_limited: bool,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub last_check: DateTime<Utc>,
}

/// Response-time aggregate over the metrics sliding window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

/// Counters and response-time stats for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetricsSnapshot {
    pub provider: ProviderName,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cached_requests: u64,
    pub response_times: ResponseTimeStats,
    pub timeout_errors: u64,
    pub rate_limit_errors: u64,
    pub network_errors: u64,
    pub parse_errors: u64,
    pub circuit_opened: u64,
    pub circuit_closed: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}
