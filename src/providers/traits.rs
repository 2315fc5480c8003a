use crate::config::ProviderSettings;
use crate::models::{
    Paper, ProviderName, SearchFilters, SearchRequest, SortBy, SortOrder,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// User agent sent to every upstream source.
pub const USER_AGENT: &str = "scholar-search/0.1 (Federated Scholarly Search)";

/// The generic query handed to an adapter. Filters a provider's
/// capabilities do not cover are dropped by the adapter, silently.
#[derive(Debug, Clone)]
pub struct ProviderQuery {
    pub query: String,
    pub limit: u32,
    pub offset: u32,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub filters: SearchFilters,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl ProviderQuery {
    /// Derive the provider-facing query from a validated search request.
    #[must_use]
    pub fn from_request(request: &SearchRequest) -> Self {
        Self {
            query: request.query.trim().to_string(),
            limit: request.limit,
            offset: request.offset,
            date_from: request.date_from,
            date_to: request.date_to,
            filters: request.filters.clone(),
            sort_by: request.sort_by,
            sort_order: request.sort_order,
        }
    }
}

/// Ambient settings for one upstream call.
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub timeout: Duration,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

impl Default for SearchContext {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: USER_AGENT.to_string(),
            headers: HashMap::new(),
        }
    }
}

impl SearchContext {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Feature declaration for one provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct ProviderCapabilities {
    pub full_text: bool,
    pub date_filter: bool,
    pub author_filter: bool,
    pub category_filter: bool,
    pub sort: bool,
    pub max_results: u32,
    pub max_query_length: u32,
    /// Upstream's own published ceiling, requests per minute.
    pub rate_limit_rpm: u32,
    pub real_time: bool,
    pub exact_match: bool,
    pub fuzzy_match: bool,
    pub wildcard: bool,
    /// Whether `get_paper` by source id is supported at all.
    pub id_lookup: bool,
}

/// Result of one provider search, already normalized to canonical papers.
#[derive(Debug, Clone)]
pub struct ProviderSearchResult {
    pub provider: ProviderName,
    pub papers: Vec<Paper>,
    /// Estimate; the preprint feed has no authoritative count.
    pub total_count: Option<u64>,
    pub duration: Duration,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub has_more: bool,
    /// Upstream records dropped during parsing (e.g. missing title).
    pub discarded: u32,
}

/// Uniform contract every upstream source adapter implements.
///
/// Adapters are stateless apart from their configuration; the mutable
/// metrics/circuit/limiter triple lives on the envelope that wraps them.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider identifier.
    fn name(&self) -> ProviderName;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Translate and execute the query, parsing into canonical papers.
    async fn search(
        &self,
        query: &ProviderQuery,
        context: &SearchContext,
    ) -> Result<ProviderSearchResult>;

    /// Fetch a single paper by its provider-local source id.
    async fn get_paper(&self, source_id: &str, context: &SearchContext) -> Result<Paper>;

    /// Probe the upstream; errors are classified HealthCheck.
    async fn health_check(&self, context: &SearchContext) -> Result<()>;

    /// Apply new settings (API key, endpoint override).
    async fn configure(&self, settings: ProviderSettings) -> Result<()>;

    /// Validate settings without applying them.
    fn validate_config(&self, settings: &ProviderSettings) -> Result<()>;
}

/// Classify an upstream HTTP status into the error taxonomy.
pub(crate) fn classify_status(
    provider: ProviderName,
    status: reqwest::StatusCode,
    body: &str,
) -> crate::Error {
    use crate::Error;
    match status.as_u16() {
        401 | 403 => Error::Authentication(format!("{provider}: HTTP {status}")),
        404 => Error::NotFound {
            resource: "paper".to_string(),
            id: provider.to_string(),
        },
        429 => Error::RateLimit {
            provider: provider.to_string(),
            retry_after: parse_retry_after(body),
        },
        500..=599 => Error::upstream(format!("{provider}: HTTP {status}")),
        _ => Error::Network {
            message: format!("{provider}: HTTP {status}: {}", truncate_body(body)),
        },
    }
}

/// Some upstreams put a retry window into the 429 body.
fn parse_retry_after(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after")
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Trim an excerpt to `max_chars`, appending an ellipsis when cut.
#[must_use]
pub fn truncate_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
