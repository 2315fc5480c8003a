//! Property-based tests for the identity functions and validation rules.

use proptest::prelude::*;
use scholar_search::broker::parse_size;
use scholar_search::models::{
    dedup_key, normalize_arxiv_id, normalize_doi, quality_score, Author, Paper, ProviderName,
    SearchRequest,
};
use scholar_search::search::merge_papers;

mod fingerprint_props {
    use super::*;
    use scholar_search::models::query_fingerprint;

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(query in r"[a-zA-Z0-9 ]{1,80}") {
            let a = SearchRequest::new(query.clone());
            let b = SearchRequest::new(query);
            prop_assert_eq!(query_fingerprint(&a), query_fingerprint(&b));
        }

        #[test]
        fn fingerprint_ignores_case_and_spacing(query in r"[a-zA-Z0-9]{1,20}( [a-zA-Z0-9]{1,20}){0,5}") {
            let upper = SearchRequest::new(query.to_uppercase());
            let padded = SearchRequest::new(format!("  {}  ", query.to_lowercase()));
            prop_assert_eq!(query_fingerprint(&upper), query_fingerprint(&padded));
        }
    }
}

mod validation_props {
    use super::*;

    proptest! {
        #[test]
        fn limits_above_the_ceiling_are_rejected(limit in 101u32..100_000) {
            let mut request = SearchRequest::new("valid query");
            request.limit = limit;
            prop_assert!(request.validate().is_err());
        }

        #[test]
        fn limits_within_bounds_are_accepted(limit in 1u32..=100) {
            let mut request = SearchRequest::new("valid query");
            request.limit = limit;
            prop_assert!(request.validate().is_ok());
        }

        #[test]
        fn overlong_queries_are_rejected(extra in 1usize..500) {
            let mut request = SearchRequest::new("q".repeat(1000 + extra));
            prop_assert!(request.validate().is_err());
        }
    }
}

mod identifier_props {
    use super::*;

    proptest! {
        #[test]
        fn doi_normalization_is_idempotent(doi in r"10\.\d{4,6}/[a-zA-Z0-9._-]{1,30}") {
            let once = normalize_doi(&doi).unwrap();
            let twice = normalize_doi(&once).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn arxiv_version_suffixes_never_survive(
            id in r"\d{4}\.\d{4,5}",
            version in 1u32..50,
        ) {
            let with_version = format!("{id}v{version}");
            prop_assert_eq!(normalize_arxiv_id(&with_version), Some(id));
        }
    }
}

mod quality_props {
    use super::*;

    proptest! {
        #[test]
        fn quality_is_always_within_unit_interval(
            citations in 0u32..2_000_000,
            with_abstract in any::<bool>(),
            author_count in 0usize..6,
        ) {
            let mut paper = Paper::new(ProviderName::Arxiv, "1", "Title").unwrap();
            paper.citation_count = citations;
            if with_abstract {
                paper.abstract_text = Some("text".to_string());
            }
            for i in 0..author_count {
                paper.authors.push(Author::from_name(&format!("Author {i}")).unwrap());
            }
            let score = quality_score(&paper);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn more_citations_never_lower_quality(a in 0u32..10_000, b in 0u32..10_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let mut paper = Paper::new(ProviderName::Arxiv, "1", "Title").unwrap();
            paper.citation_count = low;
            let low_score = quality_score(&paper);
            paper.citation_count = high;
            prop_assert!(quality_score(&paper) >= low_score);
        }
    }
}

mod merge_props {
    use super::*;

    proptest! {
        #[test]
        fn merging_never_grows_the_set(titles in prop::collection::vec(r"[a-zA-Z ]{1,30}", 1..20)) {
            let papers: Vec<Paper> = titles
                .iter()
                .enumerate()
                .map(|(i, title)| {
                    Paper::new(ProviderName::Exa, &format!("id{i}"), title).unwrap()
                })
                .collect();
            let incoming = papers.len();
            let merged = merge_papers(papers);
            prop_assert!(merged.len() <= incoming);
            prop_assert!(!merged.is_empty());
        }

        #[test]
        fn duplicated_dois_always_collapse(doi in r"10\.\d{4}/[a-z0-9]{1,10}") {
            let mut a = Paper::new(ProviderName::Arxiv, "1", "Title A").unwrap();
            a.set_doi(&doi);
            let mut b = Paper::new(ProviderName::SemanticScholar, "2", "Title B").unwrap();
            b.set_doi(&doi);
            prop_assert_eq!(merge_papers(vec![a, b]).len(), 1);
        }

        #[test]
        fn merged_papers_have_unique_dedup_keys(seed in prop::collection::vec(0u8..4, 2..16)) {
            let papers: Vec<Paper> = seed
                .iter()
                .enumerate()
                .map(|(i, group)| {
                    // Several providers emitting a handful of shared titles.
                    Paper::new(
                        ProviderName::Tavily,
                        &format!("src{i}"),
                        &format!("Shared Title {group}"),
                    )
                    .unwrap()
                })
                .collect();
            let merged = merge_papers(papers);
            let mut keys: Vec<String> = merged.iter().map(dedup_key).collect();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), merged.len());
        }
    }
}

mod size_props {
    use super::*;

    proptest! {
        #[test]
        fn sized_units_round_trip(value in 0u64..1024) {
            prop_assert_eq!(parse_size(&format!("{value}B")).unwrap(), value);
            prop_assert_eq!(parse_size(&format!("{value}KB")).unwrap(), value * 1024);
            prop_assert_eq!(parse_size(&format!("{value}MB")).unwrap(), value * 1024 * 1024);
        }

        #[test]
        fn bare_numbers_are_rejected(value in 0u64..1_000_000) {
            prop_assert!(parse_size(&value.to_string()).is_err());
        }
    }
}

mod author_metrics_props {
    use super::*;

    proptest! {
        #[test]
        fn h_index_satisfies_its_definition(citations in prop::collection::vec(0u32..200, 0..30)) {
            let author = Author::from_name("Test Author").unwrap();
            let papers: Vec<Paper> = citations
                .iter()
                .enumerate()
                .map(|(i, count)| {
                    let mut paper =
                        Paper::new(ProviderName::SemanticScholar, &format!("p{i}"), "T").unwrap();
                    paper.authors = vec![author.clone()];
                    paper.citation_count = *count;
                    paper
                })
                .collect();

            let mut author = author;
            author.recompute_metrics(&papers);
            let h = author.h_index as usize;

            // At least h papers have >= h citations.
            let at_least_h = citations.iter().filter(|&&c| c as usize >= h).count();
            prop_assert!(at_least_h >= h);
            // h is maximal: h+1 papers with >= h+1 citations do not exist.
            let above = citations.iter().filter(|&&c| c as usize >= h + 1).count();
            prop_assert!(above < h + 1);
        }
    }
}
