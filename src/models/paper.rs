use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Upstream sources the federation knows how to talk to.
///
/// Serialized snake_case; unknown strings at the edges are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Arxiv,
    SemanticScholar,
    Exa,
    Tavily,
}

impl ProviderName {
    pub const ALL: [Self; 4] = [Self::Arxiv, Self::SemanticScholar, Self::Exa, Self::Tavily];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arxiv => "arxiv",
            Self::SemanticScholar => "semantic_scholar",
            Self::Exa => "exa",
            Self::Tavily => "tavily",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arxiv" => Ok(Self::Arxiv),
            "semantic_scholar" => Ok(Self::SemanticScholar),
            "exa" => Ok(Self::Exa),
            "tavily" => Ok(Self::Tavily),
            other => Err(Error::Validation {
                field: "provider".to_string(),
                reason: format!("unknown provider '{other}'"),
            }),
        }
    }
}

/// Processing state of a paper in the ingestion pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Sources a category code can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CategorySource {
    Arxiv,
    SemanticScholar,
    Internal,
}

impl CategorySource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arxiv => "arxiv",
            Self::SemanticScholar => "semantic_scholar",
            Self::Internal => "internal",
        }
    }
}

/// A paper author. Metrics are derived from ingested papers, never taken
/// from user input.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Author {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
    #[serde(default)]
    pub research_areas: BTreeSet<String>,
    #[serde(default)]
    pub paper_count: u32,
    #[serde(default)]
    pub citation_count: u32,
    #[serde(default)]
    pub h_index: u32,
}

impl Author {
    /// Create an author from a display name. The id is the name-normalized
    /// identity used when merging author lists across providers.
    pub fn from_name(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation {
                field: "author.name".to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }
        Ok(Self {
            id: normalize_author_name(name),
            name: name.to_string(),
            email: None,
            affiliation: None,
            orcid: None,
            research_areas: BTreeSet::new(),
            paper_count: 0,
            citation_count: 0,
            h_index: 0,
        })
    }

    /// Set and validate an ORCID identifier (dddd-dddd-dddd-dddX).
    pub fn set_orcid(&mut self, orcid: &str) -> Result<()> {
        if !is_valid_orcid(orcid) {
            return Err(Error::Validation {
                field: "author.orcid".to_string(),
                reason: format!("'{orcid}' is not a valid ORCID"),
            });
        }
        self.orcid = Some(orcid.to_string());
        Ok(())
    }

    /// Surname used in the title/author/year dedup key.
    #[must_use]
    pub fn surname(&self) -> &str {
        self.name.rsplit(' ').next().unwrap_or(&self.name)
    }

    /// Recompute paper count, citation count and h-index from the papers
    /// this author appears on.
    pub fn recompute_metrics<'a, I>(&mut self, papers: I)
    where
        I: IntoIterator<Item = &'a Paper>,
    {
        let mut citation_counts: Vec<u32> = papers
            .into_iter()
            .filter(|p| p.authors.iter().any(|a| a.id == self.id))
            .map(|p| p.citation_count)
            .collect();

        self.paper_count = citation_counts.len() as u32;
        self.citation_count = citation_counts.iter().sum();

        // h-index: the largest h such that at least h papers have >= h
        // citations each.
        citation_counts.sort_unstable_by(|a, b| b.cmp(a));
        self.h_index = citation_counts
            .iter()
            .enumerate()
            .take_while(|(i, &c)| c as usize > *i)
            .count() as u32;
    }
}

/// Subject category, `<source>_<code>`, arranged in an acyclic tree.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub level: u32,
    pub source: CategorySource,
    #[serde(default)]
    pub paper_count: u32,
}

impl Category {
    pub fn new(source: CategorySource, code: &str, name: &str) -> Result<Self> {
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::Validation {
                field: "category.code".to_string(),
                reason: "code cannot be empty".to_string(),
            });
        }
        Ok(Self {
            id: format!("{}_{}", source.as_str(), code),
            name: name.trim().to_string(),
            parent: None,
            level: 0,
            source,
            paper_count: 0,
        })
    }

    /// Attach this category beneath a parent. Fails when the link would
    /// introduce a cycle. Level becomes depth from the root.
    pub fn link_parent(&mut self, parent: &Self) -> Result<()> {
        if parent.id == self.id {
            return Err(Error::Validation {
                field: "category.parent".to_string(),
                reason: format!("category '{}' cannot be its own parent", self.id),
            });
        }
        self.parent = Some(parent.id.clone());
        self.level = parent.level + 1;
        Ok(())
    }
}

/// Verify a category set forms an acyclic forest with consistent levels.
pub fn validate_category_tree(categories: &[Category]) -> Result<()> {
    use std::collections::HashMap;

    let by_id: HashMap<&str, &Category> = categories.iter().map(|c| (c.id.as_str(), c)).collect();
    for category in categories {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        seen.insert(category.id.as_str());
        let mut cursor = category.parent.as_deref();
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                return Err(Error::Validation {
                    field: "category.parent".to_string(),
                    reason: format!("cycle through category '{parent_id}'"),
                });
            }
            cursor = by_id.get(parent_id).and_then(|p| p.parent.as_deref());
        }
    }
    Ok(())
}

/// Canonical paper record every provider response is normalized into.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Paper {
    /// Globally unique identifier, `<provider>_<sourceId>`.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arxiv_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    /// Source URLs from other providers kept through a merge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_urls: Vec<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub citation_count: u32,
    #[serde(default)]
    pub references: BTreeSet<String>,
    #[serde(default)]
    pub citations: BTreeSet<String>,
    /// Two-letter language code.
    #[serde(default = "default_language")]
    pub language: String,
    pub source_provider: ProviderName,
    pub source_id: String,
    #[serde(default)]
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Paper {
    /// Create a canonical paper. The title is required; adapters discard
    /// titleless upstream records before reaching this constructor.
    pub fn new(provider: ProviderName, source_id: &str, title: &str) -> Result<Self> {
        let source_id = source_id.trim();
        let title = title.trim();
        if source_id.is_empty() {
            return Err(Error::Validation {
                field: "paper.source_id".to_string(),
                reason: "source id cannot be empty".to_string(),
            });
        }
        if title.is_empty() {
            return Err(Error::Validation {
                field: "paper.title".to_string(),
                reason: "title cannot be empty".to_string(),
            });
        }
        let now = Utc::now();
        Ok(Self {
            id: format!("{provider}_{source_id}"),
            title: title.to_string(),
            doi: None,
            arxiv_id: None,
            abstract_text: None,
            journal: None,
            published_at: None,
            url: None,
            pdf_url: None,
            alternate_urls: Vec::new(),
            authors: Vec::new(),
            categories: Vec::new(),
            keywords: BTreeSet::new(),
            citation_count: 0,
            references: BTreeSet::new(),
            citations: BTreeSet::new(),
            language: default_language(),
            source_provider: provider,
            source_id: source_id.to_string(),
            processing_state: ProcessingState::Pending,
            quality_score: 0.0,
            full_text: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Set the DOI, normalized to lowercase with common prefixes stripped.
    pub fn set_doi(&mut self, doi: &str) {
        if let Some(normalized) = normalize_doi(doi) {
            self.doi = Some(normalized);
        }
    }

    /// Set the arXiv id with any version suffix removed.
    pub fn set_arxiv_id(&mut self, raw: &str) {
        if let Some(normalized) = normalize_arxiv_id(raw) {
            self.arxiv_id = Some(normalized);
        }
    }

    /// Record a citing paper id, keeping `citation_count == |citations|`.
    pub fn add_citation(&mut self, citing_id: &str) {
        if self.citations.insert(citing_id.to_string()) {
            self.citation_count = self.citations.len() as u32;
            self.updated_at = Utc::now();
        }
    }

    /// Publication year, used by the dedup key.
    #[must_use]
    pub fn published_year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.published_at.map(|d| d.year())
    }

    /// Recompute and store the quality score.
    pub fn refresh_quality(&mut self) {
        self.quality_score = quality_score(self);
    }
}

/// Deterministic quality heuristic, bounded to [0, 1].
///
/// Accrues for each populated field, plus a citation factor that
/// asymptotically approaches 0.20 as the citation count grows.
#[must_use]
pub fn quality_score(paper: &Paper) -> f64 {
    let mut score = 0.0_f64;
    if !paper.title.is_empty() {
        score += 0.10;
    }
    if paper.abstract_text.as_deref().is_some_and(|a| !a.is_empty()) {
        score += 0.20;
    }
    if !paper.authors.is_empty() {
        score += 0.10;
    }
    if paper.authors.len() >= 2 {
        score += 0.10;
    }
    if paper.journal.is_some() {
        score += 0.10;
    }
    if paper.published_at.is_some() {
        score += 0.10;
    }
    if paper.full_text.is_some() {
        score += 0.10;
    }
    if paper.pdf_url.is_some() {
        score += 0.10;
    }
    let citations = f64::from(paper.citation_count);
    score += 0.20 * (1.0 - 1.0 / (1.0 + citations));
    score.min(1.0)
}

/// Normalize a DOI: strip `doi:`/resolver prefixes, lowercase.
#[must_use]
pub fn normalize_doi(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
        .trim_start_matches("doi:")
        .trim();
    if cleaned.is_empty() || !cleaned.contains('/') {
        return None;
    }
    Some(cleaned.to_lowercase())
}

/// Normalize an arXiv identifier: strip `arXiv:` prefix, URL path and any
/// trailing version suffix (`v1`, `v2`, ...).
#[must_use]
pub fn normalize_arxiv_id(raw: &str) -> Option<String> {
    let mut id = raw.trim();
    if let Some(pos) = id.rfind("/abs/") {
        id = &id[pos + 5..];
    }
    id = id.trim_start_matches("arXiv:").trim_start_matches("arxiv:");
    if id.is_empty() {
        return None;
    }
    // Strip a trailing vN suffix.
    if let Some(pos) = id.rfind('v') {
        let (head, tail) = id.split_at(pos);
        if !head.is_empty() && tail.len() > 1 && tail[1..].chars().all(|c| c.is_ascii_digit()) {
            id = head;
        }
    }
    Some(id.to_string())
}

/// Name-normalized author identity used when merging author lists.
#[must_use]
pub fn normalize_author_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_valid_orcid(orcid: &str) -> bool {
    let parts: Vec<&str> = orcid.split('-').collect();
    if parts.len() != 4 {
        return false;
    }
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 4 {
            return false;
        }
        let last_group = i == 3;
        for (j, c) in part.chars().enumerate() {
            let checksum_slot = last_group && j == 3;
            if !(c.is_ascii_digit() || (checksum_slot && c == 'X')) {
                return false;
            }
        }
    }
    true
}
