use super::traits::{
    classify_status, ProviderAdapter, ProviderCapabilities, ProviderQuery, ProviderSearchResult,
    SearchContext,
};
use crate::config::ProviderSettings;
use crate::models::{
    generate_request_id, normalize_arxiv_id, Author, Category, CategorySource, Paper, ProviderName,
    SortBy,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_BASE_URL: &str = "https://export.arxiv.org/api/query";

/// Preprint provider backed by the arXiv Atom export API.
pub struct ArxivAdapter {
    client: Client,
    settings: RwLock<ProviderSettings>,
}

impl ArxivAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(super::traits::USER_AGENT)
            .build()
            .map_err(|e| Error::Network {
                message: format!("failed to build arxiv HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            settings: RwLock::new(settings),
        })
    }

    async fn base_url(&self) -> String {
        self.settings
            .read()
            .await
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Build the export API URL with combined field qualifiers. Filters the
    /// feed cannot express (journal, min_citations) are dropped here.
    async fn build_search_url(&self, query: &ProviderQuery) -> Result<String> {
        let mut url = Url::parse(&self.base_url().await).map_err(|e| Error::Validation {
            field: "arxiv.base_url".to_string(),
            reason: e.to_string(),
        })?;

        let mut terms = vec![format!("all:\"{}\"", query.query)];
        if let Some(author) = &query.filters.author {
            terms.push(format!("au:\"{author}\""));
        }
        if let Some(category) = &query.filters.category {
            terms.push(format!("cat:{category}"));
        }
        if query.date_from.is_some() || query.date_to.is_some() {
            let from = query
                .date_from
                .map_or_else(|| "190001010000".to_string(), format_feed_date);
            let to = query
                .date_to
                .map_or_else(|| format_feed_date(Utc::now()), format_feed_date);
            terms.push(format!("submittedDate:[{from} TO {to}]"));
        }
        if !query.filters.keywords.is_empty() || query.filters.journal.is_some() {
            debug!("arxiv: dropping unsupported keyword/journal filters");
        }

        let sort_by = match query.sort_by {
            SortBy::Relevance => "relevance",
            _ => "submittedDate",
        };

        url.query_pairs_mut()
            .append_pair("search_query", &terms.join(" AND "))
            .append_pair("start", &query.offset.to_string())
            .append_pair("max_results", &query.limit.to_string())
            .append_pair("sortBy", sort_by)
            .append_pair("sortOrder", "descending");

        Ok(url.to_string())
    }

    async fn fetch(&self, url: &str, context: &SearchContext) -> Result<String> {
        let mut request = self.client.get(url).timeout(context.timeout);
        for (key, value) in &context.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(Error::from)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(ProviderName::Arxiv, status, &body));
        }
        Ok(response.text().await.map_err(Error::from)?)
    }

    /// Parse the Atom feed. Entries without a title are discarded and
    /// counted, never poisoning the batch.
    fn parse_feed(&self, body: &str) -> Result<(Vec<Paper>, Option<u64>, u32)> {
        let doc = roxmltree::Document::parse(body).map_err(|e| Error::Parse {
            context: "arxiv atom feed".to_string(),
            message: e.to_string(),
        })?;

        let total_count = doc
            .descendants()
            .find(|n| n.has_tag_name("totalResults"))
            .and_then(|n| n.text())
            .and_then(|t| t.trim().parse::<u64>().ok());

        let mut papers = Vec::new();
        let mut discarded = 0_u32;

        for entry in doc.descendants().filter(|n| n.has_tag_name("entry")) {
            match Self::parse_entry(&entry) {
                Ok(paper) => papers.push(paper),
                Err(error) => {
                    discarded += 1;
                    warn!(%error, "arxiv: discarding unparsable feed entry");
                }
            }
        }

        Ok((papers, total_count, discarded))
    }

    fn parse_entry(entry: &roxmltree::Node<'_, '_>) -> Result<Paper> {
        let raw_id = entry
            .children()
            .find(|n| n.has_tag_name("id"))
            .and_then(|n| n.text())
            .unwrap_or_default();
        let source_id = normalize_arxiv_id(raw_id).ok_or_else(|| Error::Parse {
            context: "arxiv entry".to_string(),
            message: "entry without an id".to_string(),
        })?;

        let title = entry
            .children()
            .find(|n| n.has_tag_name("title"))
            .and_then(|n| n.text())
            .map(collapse_whitespace)
            .unwrap_or_default();
        if title.is_empty() {
            return Err(Error::Parse {
                context: "arxiv entry".to_string(),
                message: format!("entry {source_id} has no title"),
            });
        }

        let mut paper = Paper::new(ProviderName::Arxiv, &source_id, &title)?;
        paper.set_arxiv_id(&source_id);
        paper.journal = Some("arXiv".to_string());

        for child in entry.children().filter(roxmltree::Node::is_element) {
            match child.tag_name().name() {
                // The feed summary is used verbatim as the abstract.
                "summary" => {
                    if let Some(summary) = child.text() {
                        paper.abstract_text = Some(collapse_whitespace(summary));
                    }
                }
                "published" => {
                    if let Some(text) = child.text() {
                        paper.published_at = DateTime::parse_from_rfc3339(text.trim())
                            .ok()
                            .map(|d| d.with_timezone(&Utc));
                    }
                }
                "author" => {
                    for name_node in child.descendants().filter(|n| n.has_tag_name("name")) {
                        if let Some(name) = name_node.text() {
                            if let Ok(author) = Author::from_name(name) {
                                paper.authors.push(author);
                            }
                        }
                    }
                }
                "link" => {
                    let href = child.attribute("href").unwrap_or_default();
                    if child.attribute("type") == Some("application/pdf") {
                        paper.pdf_url = Some(href.to_string());
                    } else if child.attribute("rel") == Some("alternate") {
                        paper.url = Some(href.to_string());
                    }
                }
                "category" => {
                    if let Some(term) = child.attribute("term") {
                        if let Ok(category) = Category::new(CategorySource::Arxiv, term, term) {
                            if !paper.categories.iter().any(|c| c.id == category.id) {
                                paper.categories.push(category);
                            }
                        }
                    }
                }
                "doi" => {
                    if let Some(doi) = child.text() {
                        paper.set_doi(doi);
                    }
                }
                "journal_ref" => {
                    if let Some(journal) = child.text() {
                        paper.journal = Some(collapse_whitespace(journal));
                    }
                }
                _ => {}
            }
        }

        paper.refresh_quality();
        Ok(paper)
    }
}

fn format_feed_date(date: DateTime<Utc>) -> String {
    date.format("%Y%m%d%H%M").to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl ProviderAdapter for ArxivAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Arxiv
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            full_text: true,
            date_filter: true,
            author_filter: true,
            category_filter: true,
            sort: true,
            max_results: 2000,
            max_query_length: 1000,
            rate_limit_rpm: 20,
            real_time: false,
            exact_match: true,
            fuzzy_match: false,
            wildcard: true,
            id_lookup: true,
        }
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        context: &SearchContext,
    ) -> Result<ProviderSearchResult> {
        let started = Instant::now();
        let url = self.build_search_url(query).await?;
        debug!(%url, "arxiv search");

        let body = self.fetch(&url, context).await?;
        let (papers, total_count, discarded) = self.parse_feed(&body)?;
        let has_more = papers.len() as u32 >= query.limit;
        // No authoritative count in the feed; fall back to a lower bound.
        let total_count = total_count
            .or_else(|| Some(u64::from(query.offset) + papers.len() as u64 + u64::from(has_more)));

        info!(
            count = papers.len(),
            discarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "arxiv search completed"
        );

        Ok(ProviderSearchResult {
            provider: ProviderName::Arxiv,
            papers,
            total_count,
            duration: started.elapsed(),
            request_id: generate_request_id(),
            timestamp: Utc::now(),
            success: true,
            has_more,
            discarded,
        })
    }

    async fn get_paper(&self, source_id: &str, context: &SearchContext) -> Result<Paper> {
        let id = normalize_arxiv_id(source_id).ok_or_else(|| Error::Validation {
            field: "source_id".to_string(),
            reason: format!("'{source_id}' is not an arXiv id"),
        })?;

        let mut url = Url::parse(&self.base_url().await).map_err(|e| Error::Validation {
            field: "arxiv.base_url".to_string(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("id_list", &id)
            .append_pair("max_results", "1");

        let body = self.fetch(url.as_str(), context).await?;
        let (papers, _, _) = self.parse_feed(&body)?;
        papers.into_iter().next().ok_or_else(|| Error::NotFound {
            resource: "paper".to_string(),
            id: format!("arxiv_{id}"),
        })
    }

    async fn health_check(&self, context: &SearchContext) -> Result<()> {
        let query = ProviderQuery {
            query: "electron".to_string(),
            limit: 1,
            offset: 0,
            date_from: None,
            date_to: None,
            filters: Default::default(),
            sort_by: SortBy::Relevance,
            sort_order: Default::default(),
        };
        self.search(&query, context)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                // A throttled upstream is still an alive upstream.
                Error::RateLimit { .. } => Error::RateLimit {
                    provider: ProviderName::Arxiv.to_string(),
                    retry_after: None,
                },
                other => Error::HealthCheck {
                    provider: ProviderName::Arxiv.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    async fn configure(&self, settings: ProviderSettings) -> Result<()> {
        self.validate_config(&settings)?;
        *self.settings.write().await = settings;
        Ok(())
    }

    fn validate_config(&self, settings: &ProviderSettings) -> Result<()> {
        if let Some(base_url) = &settings.base_url {
            Url::parse(base_url).map_err(|e| Error::Validation {
                field: "arxiv.base_url".to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SortOrder;

    fn adapter() -> ArxivAdapter {
        ArxivAdapter::new(ProviderSettings::default()).unwrap()
    }

    fn query(text: &str) -> ProviderQuery {
        ProviderQuery {
            query: text.to_string(),
            limit: 10,
            offset: 0,
            date_from: None,
            date_to: None,
            filters: Default::default(),
            sort_by: SortBy::PublishedDate,
            sort_order: SortOrder::Desc,
        }
    }

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <opensearch:totalResults>42</opensearch:totalResults>
  <entry>
    <id>http://arxiv.org/abs/1706.03762v5</id>
    <title>Attention Is All You Need</title>
    <summary>  The dominant sequence transduction models...  </summary>
    <published>2017-06-12T17:57:34Z</published>
    <author><name>Ashish Vaswani</name></author>
    <author><name>Noam Shazeer</name></author>
    <link rel="alternate" type="text/html" href="http://arxiv.org/abs/1706.03762v5"/>
    <link title="pdf" type="application/pdf" href="http://arxiv.org/pdf/1706.03762v5"/>
    <category term="cs.CL"/>
    <category term="cs.LG"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2403.99999v1</id>
    <title></title>
  </entry>
</feed>"#;

    #[tokio::test]
    async fn url_carries_field_qualifiers() {
        let adapter = adapter();
        let mut q = query("graph neural networks");
        q.filters.author = Some("Kipf".to_string());
        q.filters.category = Some("cs.LG".to_string());
        let url = adapter.build_search_url(&q).await.unwrap();
        assert!(url.contains("search_query="));
        assert!(url.contains("au"));
        assert!(url.contains("cat"));
        assert!(url.contains("sortBy=submittedDate"));
        assert!(url.contains("sortOrder=descending"));
        assert!(url.contains("max_results=10"));
    }

    #[test]
    fn feed_parses_to_canonical_papers() {
        let adapter = adapter();
        let (papers, total, discarded) = adapter.parse_feed(FEED).unwrap();
        assert_eq!(total, Some(42));
        assert_eq!(papers.len(), 1);
        assert_eq!(discarded, 1); // the titleless entry

        let paper = &papers[0];
        assert_eq!(paper.id, "arxiv_1706.03762");
        assert_eq!(paper.arxiv_id.as_deref(), Some("1706.03762"));
        assert_eq!(paper.title, "Attention Is All You Need");
        assert_eq!(paper.authors.len(), 2);
        assert_eq!(paper.categories.len(), 2);
        assert!(paper.pdf_url.as_deref().unwrap().contains("pdf"));
        assert!(paper.abstract_text.as_deref().unwrap().starts_with("The dominant"));
        assert!(paper.quality_score > 0.0);
    }

    #[tokio::test]
    async fn date_range_is_expressed_in_feed_syntax() {
        let adapter = adapter();
        let mut q = query("quantum");
        q.date_from = Some(Utc::now() - chrono::Duration::days(30));
        q.date_to = Some(Utc::now());
        let url = adapter.build_search_url(&q).await.unwrap();
        assert!(url.contains("submittedDate"));
    }
}
