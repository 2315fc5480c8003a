//! Stable subject taxonomy for the internal event bus.

pub const PAPERS_INDEXED: &str = "papers.indexed";
pub const PAPERS_PROCESSING: &str = "papers.processing";
pub const PAPERS_QUALITY_UPDATED: &str = "papers.quality_updated";
pub const PAPERS_CITATIONS_UPDATED: &str = "papers.citations_updated";

pub const INDEXING_STARTED: &str = "indexing.started";
pub const INDEXING_COMPLETED: &str = "indexing.completed";
pub const INDEXING_FAILED: &str = "indexing.failed";
pub const INDEXING_PROGRESS: &str = "indexing.progress";

pub const SEARCH_REQUEST: &str = "search.request";
pub const SEARCH_COMPLETED: &str = "search.completed";
pub const SEARCH_CACHED: &str = "search.cached";
pub const SEARCH_ANALYTICS: &str = "search.analytics";

pub const ANALYTICS_QUERY: &str = "analytics.query";
pub const ANALYTICS_CLICK: &str = "analytics.click";
pub const ANALYTICS_FILTER: &str = "analytics.filter";
pub const ANALYTICS_EXPORT: &str = "analytics.export";

pub const NOTIFICATIONS_SYSTEM: &str = "notifications.system";
pub const NOTIFICATIONS_USER: &str = "notifications.user";
pub const NOTIFICATIONS_EMAIL: &str = "notifications.email";

pub const ALERTS_HEALTH_CHECK: &str = "alerts.health_check";
pub const ALERTS_PERFORMANCE: &str = "alerts.performance";
pub const ALERTS_SECURITY: &str = "alerts.security";
pub const ALERTS_ERROR: &str = "alerts.error";

pub const METRICS_SYSTEM: &str = "metrics.system";
pub const METRICS_APPLICATION: &str = "metrics.application";
pub const METRICS_USER: &str = "metrics.user";

/// Subject prefix used by the tool facade for request/reply dispatch.
pub const TOOLS_REQUEST: &str = "tools.request";

/// Inbox prefix for request/reply round trips.
pub const INBOX_PREFIX: &str = "_inbox.";

/// Durable subject families require acknowledgment and are persisted when
/// the broker has a stream store.
#[must_use]
pub fn is_durable(subject: &str) -> bool {
    subject.starts_with("papers.") || subject.starts_with("indexing.")
}

/// Token-wise subject matching: `*` matches exactly one token.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_families() {
        assert!(is_durable(PAPERS_INDEXED));
        assert!(is_durable(INDEXING_FAILED));
        assert!(!is_durable(SEARCH_COMPLETED));
        assert!(!is_durable(METRICS_SYSTEM));
    }

    #[test]
    fn wildcard_matches_one_token() {
        assert!(subject_matches("papers.*", PAPERS_INDEXED));
        assert!(subject_matches(SEARCH_REQUEST, SEARCH_REQUEST));
        assert!(!subject_matches("papers.*", "papers"));
        assert!(!subject_matches("papers.*", "indexing.started"));
        assert!(!subject_matches("papers.indexed", "papers.processing"));
        assert!(subject_matches("*.indexed", PAPERS_INDEXED));
    }
}
