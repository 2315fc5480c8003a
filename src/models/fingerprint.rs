//! Query fingerprints and paper dedup keys.
//!
//! The fingerprint summarizes a request so that semantically equivalent
//! queries share a cache key; the dedup key is the identity used to merge
//! records from multiple providers.

use crate::models::paper::Paper;
use crate::models::search::SearchRequest;
use sha2::{Digest, Sha256};

/// Collapse whitespace and lowercase a free-text query.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 fingerprint over the normalized query, sorted filters, date range
/// and provider subset. Hex encoded.
#[must_use]
pub fn query_fingerprint(request: &SearchRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(&request.query).as_bytes());
    hasher.update([0x1f]);
    for (key, value) in request.filters.sorted_pairs() {
        hasher.update(key.as_bytes());
        hasher.update([0x1e]);
        hasher.update(value.as_bytes());
        hasher.update([0x1f]);
    }
    if let Some(from) = request.date_from {
        hasher.update(from.timestamp_millis().to_be_bytes());
    }
    hasher.update([0x1f]);
    if let Some(to) = request.date_to {
        hasher.update(to.timestamp_millis().to_be_bytes());
    }
    hasher.update([0x1f]);
    if let Some(providers) = &request.providers {
        let mut names: Vec<&str> = providers.iter().map(|p| p.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update([0x1e]);
        }
    }
    hex_digest(hasher)
}

/// Dedup identity for a paper: normalized DOI when present, else the arXiv
/// id, else a digest of title, first-author surname and publication year.
#[must_use]
pub fn dedup_key(paper: &Paper) -> String {
    if let Some(doi) = &paper.doi {
        return format!("doi:{doi}");
    }
    if let Some(arxiv_id) = &paper.arxiv_id {
        return format!("arxiv:{arxiv_id}");
    }
    let mut hasher = Sha256::new();
    hasher.update(paper.title.trim().to_lowercase().as_bytes());
    hasher.update([0x1f]);
    if let Some(first_author) = paper.authors.first() {
        hasher.update(first_author.surname().to_lowercase().as_bytes());
    }
    hasher.update([0x1f]);
    if let Some(year) = paper.published_year() {
        hasher.update(year.to_be_bytes());
    }
    format!("title:{}", hex_digest(hasher))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::paper::ProviderName;

    #[test]
    fn whitespace_and_case_do_not_change_the_fingerprint() {
        let a = SearchRequest::new("Graph  Neural\tNetworks");
        let b = SearchRequest::new("graph neural networks");
        assert_eq!(query_fingerprint(&a), query_fingerprint(&b));
    }

    #[test]
    fn provider_subset_changes_the_fingerprint() {
        let a = SearchRequest::new("attention");
        let mut b = SearchRequest::new("attention");
        b.providers = Some(vec![ProviderName::Arxiv]);
        assert_ne!(query_fingerprint(&a), query_fingerprint(&b));
    }

    #[test]
    fn provider_order_does_not_change_the_fingerprint() {
        let mut a = SearchRequest::new("attention");
        a.providers = Some(vec![ProviderName::Arxiv, ProviderName::Exa]);
        let mut b = SearchRequest::new("attention");
        b.providers = Some(vec![ProviderName::Exa, ProviderName::Arxiv]);
        assert_eq!(query_fingerprint(&a), query_fingerprint(&b));
    }

    #[test]
    fn doi_wins_over_title_in_dedup_key() {
        let mut paper = Paper::new(ProviderName::Arxiv, "1706.03762", "Attention").unwrap();
        paper.set_arxiv_id("1706.03762v5");
        assert_eq!(dedup_key(&paper), "arxiv:1706.03762");
        paper.set_doi("10.1000/XYZ");
        assert_eq!(dedup_key(&paper), "doi:10.1000/xyz");
    }

    #[test]
    fn titles_differing_only_in_case_share_a_key() {
        let a = Paper::new(ProviderName::Exa, "1", "Attention Is All You Need").unwrap();
        let b = Paper::new(ProviderName::Tavily, "2", "attention is all you need").unwrap();
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }
}
