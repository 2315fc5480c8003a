//! Folding provider results into one ranked list: dedup-key grouping,
//! record merging and the aggregation strategies.

use crate::models::{
    dedup_key, quality_score, AggregationStrategy, Paper, ProviderName, SearchRequest, SortBy,
    SortOrder,
};
use crate::providers::ProviderSearchResult;
use std::collections::HashMap;
use tracing::debug;

/// Apply the requested strategy. `results` is in completion order;
/// `selection_order` is the provider subset as selected for the request.
#[must_use]
pub fn aggregate(
    request: &SearchRequest,
    selection_order: &[ProviderName],
    results: &[ProviderSearchResult],
) -> Vec<Paper> {
    let papers = match request.strategy {
        AggregationStrategy::Merge => {
            let mut merged = merge_papers(collect_all(results));
            sort_papers(&mut merged, request.sort_by, request.sort_order);
            merged
        }
        AggregationStrategy::BestQuality => {
            let mut merged = merge_papers(collect_all(results));
            merged.sort_by(|a, b| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            merged
        }
        AggregationStrategy::First => {
            let mut papers = selection_order
                .iter()
                .find_map(|name| {
                    results
                        .iter()
                        .find(|r| r.provider == *name)
                        .map(|r| r.papers.clone())
                })
                .unwrap_or_default();
            sort_papers(&mut papers, request.sort_by, request.sort_order);
            papers
        }
        AggregationStrategy::Fastest => {
            let mut papers = results
                .first()
                .map(|r| r.papers.clone())
                .unwrap_or_default();
            sort_papers(&mut papers, request.sort_by, request.sort_order);
            papers
        }
        AggregationStrategy::RoundRobin => round_robin(selection_order, results),
    };

    paginate(papers, request.offset, request.limit)
}

fn collect_all(results: &[ProviderSearchResult]) -> Vec<Paper> {
    results.iter().flat_map(|r| r.papers.clone()).collect()
}

/// Interleave provider lists in selection order, skipping duplicates.
fn round_robin(selection_order: &[ProviderName], results: &[ProviderSearchResult]) -> Vec<Paper> {
    let by_provider: HashMap<ProviderName, &ProviderSearchResult> =
        results.iter().map(|r| (r.provider, r)).collect();
    let lists: Vec<&[Paper]> = selection_order
        .iter()
        .filter_map(|name| by_provider.get(name).map(|r| r.papers.as_slice()))
        .collect();

    let mut seen = std::collections::HashSet::new();
    let mut interleaved = Vec::new();
    let longest = lists.iter().map(|l| l.len()).max().unwrap_or(0);
    for index in 0..longest {
        for list in &lists {
            if let Some(paper) = list.get(index) {
                if seen.insert(dedup_key(paper)) {
                    interleaved.push(paper.clone());
                }
            }
        }
    }
    interleaved
}

/// Group papers by dedup key and fold each group into one canonical record.
#[must_use]
pub fn merge_papers(papers: Vec<Paper>) -> Vec<Paper> {
    let incoming = papers.len();
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Paper>> = HashMap::new();

    for paper in papers {
        let key = dedup_key(&paper);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(paper);
    }

    let merged: Vec<Paper> = order
        .into_iter()
        .map(|key| fold_group(groups.remove(&key).unwrap_or_default()))
        .collect();

    if merged.len() < incoming {
        debug!(incoming, merged = merged.len(), "deduplicated provider results");
    }
    merged
}

/// Fold one dedup group: the highest-quality record is the base; authors,
/// categories and keywords are unioned; identifiers and URLs from the
/// other records are preserved.
fn fold_group(mut group: Vec<Paper>) -> Paper {
    debug_assert!(!group.is_empty());
    if group.len() == 1 {
        return group.pop().expect("non-empty group");
    }

    let base_index = group
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.quality_score
                .partial_cmp(&b.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map_or(0, |(i, _)| i);
    let mut base = group.swap_remove(base_index);
    let base_quality = base.quality_score;

    for other in group {
        // Identifiers survive if any source provided them.
        if base.doi.is_none() {
            base.doi = other.doi;
        }
        if base.arxiv_id.is_none() {
            base.arxiv_id = other.arxiv_id;
        }
        if base.abstract_text.is_none() {
            base.abstract_text = other.abstract_text;
        }
        if base.journal.is_none() {
            base.journal = other.journal;
        }
        if base.published_at.is_none() {
            base.published_at = other.published_at;
        }
        if base.pdf_url.is_none() {
            base.pdf_url = other.pdf_url;
        }

        // Union authors by name-normalized identity, preserving order.
        for author in other.authors {
            if !base.authors.iter().any(|a| a.id == author.id) {
                base.authors.push(author);
            }
        }
        for category in other.categories {
            if !base.categories.iter().any(|c| c.id == category.id) {
                base.categories.push(category);
            }
        }
        base.keywords.extend(other.keywords);
        base.references.extend(other.references);
        base.citations.extend(other.citations);
        base.citation_count = base.citation_count.max(other.citation_count);

        // Other providers' locations become alternate references.
        if let Some(url) = other.url {
            if base.url.as_deref() != Some(url.as_str())
                && !base.alternate_urls.contains(&url)
            {
                base.alternate_urls.push(url);
            }
        }
    }

    // Unioned fields may raise the heuristic; never drop below the base's
    // provider-assigned score.
    base.quality_score = quality_score(&base).max(base_quality);
    base
}

/// Deterministic ordering: the requested key, then quality, then
/// publication date (newest first), then id.
pub fn sort_papers(papers: &mut [Paper], sort_by: SortBy, order: SortOrder) {
    papers.sort_by(|a, b| {
        let primary = match sort_by {
            SortBy::Relevance => a
                .quality_score
                .partial_cmp(&b.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal),
            SortBy::PublishedDate => a.published_at.cmp(&b.published_at),
            SortBy::CitationCount => a.citation_count.cmp(&b.citation_count),
            SortBy::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        };
        let primary = match order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        primary
            .then_with(|| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn paginate(papers: Vec<Paper>, offset: u32, limit: u32) -> Vec<Paper> {
    papers
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}
