//! Typed payloads for the events published on the bus. Every event carries
//! a millisecond timestamp; durable payloads also carry a stable id so
//! redeliveries are recognizable.

use crate::models::{ProviderName, SearchFilters};
use serde::{Deserialize, Serialize};

/// Published on `search.request` when an orchestration begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequested {
    pub request_id: String,
    pub query: String,
    pub providers: Vec<ProviderName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub timestamp_ms: i64,
}

/// Published on `search.completed` for both success and failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCompleted {
    pub request_id: String,
    pub query: String,
    pub duration_ms: u64,
    pub providers_used: Vec<ProviderName>,
    pub providers_failed: Vec<ProviderName>,
    pub cache_hit: bool,
    pub result_count: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

/// Published on `search.cached` when a response is served from cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCacheHit {
    pub request_id: String,
    pub fingerprint: String,
    pub query: String,
    pub cache_hits: u64,
    pub timestamp_ms: i64,
}

/// Published on `search.analytics` alongside completed searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAnalytics {
    pub request_id: String,
    pub query: String,
    pub filters: SearchFilters,
    pub result_count: u32,
    pub duration_ms: u64,
    pub timestamp_ms: i64,
}

/// Durable event on `papers.indexed`: a merged paper entered the canonical
/// index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperIndexed {
    /// Stable event id; redeliveries reuse it.
    pub event_id: String,
    pub paper_id: String,
    pub provider: ProviderName,
    pub quality_score: f64,
    pub timestamp_ms: i64,
}

/// Durable event on `papers.quality_updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperQualityUpdated {
    pub event_id: String,
    pub paper_id: String,
    pub old_score: f64,
    pub new_score: f64,
    pub timestamp_ms: i64,
}

/// Durable events on `indexing.{started,completed,failed,progress}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingLifecycle {
    pub event_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::now_ms;

    #[test]
    fn events_round_trip_through_json() {
        let event = SearchCompleted {
            request_id: "req_1".to_string(),
            query: "attention".to_string(),
            duration_ms: 120,
            providers_used: vec![ProviderName::Arxiv],
            providers_failed: vec![],
            cache_hit: false,
            result_count: 3,
            success: true,
            error: None,
            timestamp_ms: now_ms(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: SearchCompleted = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, "req_1");
        assert!(back.timestamp_ms > 0);
        assert!(!json.contains("error")); // absent optional fields are omitted
    }
}
