use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scholar_search::models::{dedup_key, quality_score, Author, Paper, ProviderName};
use scholar_search::search::merge_papers;

fn synthetic_papers(count: usize, duplicates_per_paper: usize) -> Vec<Paper> {
    let mut papers = Vec::with_capacity(count * duplicates_per_paper);
    for i in 0..count {
        for provider in [
            ProviderName::Arxiv,
            ProviderName::SemanticScholar,
            ProviderName::Exa,
        ]
        .into_iter()
        .take(duplicates_per_paper)
        {
            let mut paper = Paper::new(
                provider,
                &format!("{provider}-{i}"),
                &format!("Paper Number {i}: A Study"),
            )
            .unwrap();
            paper.set_doi(&format!("10.1000/paper.{i}"));
            paper.abstract_text = Some("An abstract describing the study in detail.".to_string());
            paper.authors = vec![
                Author::from_name("First Author").unwrap(),
                Author::from_name("Second Author").unwrap(),
            ];
            paper.citation_count = (i % 500) as u32;
            paper.refresh_quality();
            papers.push(paper);
        }
    }
    papers
}

fn bench_merge(c: &mut Criterion) {
    let papers = synthetic_papers(200, 3);
    c.bench_function("merge_600_papers_200_groups", |b| {
        b.iter(|| merge_papers(black_box(papers.clone())));
    });
}

fn bench_dedup_key(c: &mut Criterion) {
    let papers = synthetic_papers(100, 1);
    c.bench_function("dedup_key_100_papers", |b| {
        b.iter(|| {
            for paper in &papers {
                black_box(dedup_key(paper));
            }
        });
    });
}

fn bench_quality(c: &mut Criterion) {
    let papers = synthetic_papers(100, 1);
    c.bench_function("quality_score_100_papers", |b| {
        b.iter(|| {
            for paper in &papers {
                black_box(quality_score(paper));
            }
        });
    });
}

criterion_group!(benches, bench_merge, bench_dedup_key, bench_quality);
criterion_main!(benches);
