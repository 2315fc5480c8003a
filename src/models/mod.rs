//! Canonical data model shared by every provider adapter and the
//! orchestrator: papers, authors, categories, search requests/responses and
//! the identity functions (fingerprint, dedup key) built on them.

pub mod fingerprint;
pub mod paper;
pub mod search;

pub use fingerprint::{dedup_key, normalize_query, query_fingerprint};
pub use paper::{
    normalize_arxiv_id, normalize_author_name, normalize_doi, quality_score,
    validate_category_tree, Author, Category, CategorySource, Paper, ProcessingState, ProviderName,
};
pub use search::{
    generate_request_id, AggregationStrategy, CircuitStateLabel, ProviderFailure,
    ProviderMetricsSnapshot, ProviderStatus, ResponseTimeStats, SearchFilters, SearchRequest,
    SearchResponse, SortBy, SortOrder, DEFAULT_LIMIT, MAX_LIMIT, MAX_QUERY_LENGTH, MIN_LIMIT,
};
