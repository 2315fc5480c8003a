use super::traits::{
    classify_status, ProviderAdapter, ProviderCapabilities, ProviderQuery, ProviderSearchResult,
    SearchContext,
};
use crate::config::ProviderSettings;
use crate::models::{
    generate_request_id, Author, Category, CategorySource, Paper, ProviderName,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.semanticscholar.org";

const SEARCH_FIELDS: &str = "title,abstract,venue,year,publicationDate,citationCount,\
url,openAccessPdf,externalIds,authors,fieldsOfStudy";

/// Scholarly-graph provider backed by the Semantic Scholar graph API.
pub struct SemanticScholarAdapter {
    client: Client,
    settings: RwLock<ProviderSettings>,
}

#[derive(Debug, Deserialize)]
struct GraphSearchResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    next: Option<u64>,
    #[serde(default)]
    data: Vec<GraphPaper>,
}

#[derive(Debug, Deserialize)]
struct GraphPaper {
    #[serde(rename = "paperId")]
    paper_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default, rename = "publicationDate")]
    publication_date: Option<String>,
    #[serde(default, rename = "citationCount")]
    citation_count: Option<u32>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "openAccessPdf")]
    open_access_pdf: Option<OpenAccessPdf>,
    #[serde(default, rename = "externalIds")]
    external_ids: Option<ExternalIds>,
    #[serde(default)]
    authors: Vec<GraphAuthor>,
    #[serde(default, rename = "fieldsOfStudy")]
    fields_of_study: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OpenAccessPdf {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    #[serde(default, rename = "DOI")]
    doi: Option<String>,
    #[serde(default, rename = "ArXiv")]
    arxiv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphAuthor {
    #[serde(default)]
    name: Option<String>,
}

impl SemanticScholarAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(super::traits::USER_AGENT)
            .build()
            .map_err(|e| Error::Network {
                message: format!("failed to build semantic_scholar HTTP client: {e}"),
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

    async fn api_key(&self) -> Option<String> {
        self.settings.read().await.api_key.clone()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        context: &SearchContext,
    ) -> Result<T> {
        let mut request = self.client.get(url).timeout(context.timeout);
        if let Some(key) = self.api_key().await {
            request = request.header("x-api-key", key);
        }
        for (key, value) in &context.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(Error::from)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(ProviderName::SemanticScholar, status, &body));
        }
        let body = response.text().await.map_err(Error::from)?;
        serde_json::from_str(&body).map_err(|e| Error::Parse {
            context: "semantic_scholar response".to_string(),
            message: e.to_string(),
        })
    }

    /// The graph API takes the author as part of the structured query and a
    /// separate fields-of-study parameter; everything else rides on the
    /// free-text query.
    fn build_query_params(query: &ProviderQuery) -> Vec<(String, String)> {
        let mut text = query.query.clone();
        if let Some(author) = &query.filters.author {
            text.push(' ');
            text.push_str(author);
        }

        let mut params = vec![
            ("query".to_string(), text),
            ("limit".to_string(), query.limit.to_string()),
            ("offset".to_string(), query.offset.to_string()),
            ("fields".to_string(), SEARCH_FIELDS.to_string()),
        ];
        if let Some(category) = &query.filters.category {
            params.push(("fieldsOfStudy".to_string(), category.clone()));
        }
        if query.date_from.is_some() || query.date_to.is_some() {
            let from = query
                .date_from
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let to = query
                .date_to
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            params.push(("publicationDateOrYear".to_string(), format!("{from}:{to}")));
        }
        if query.filters.journal.is_some() || !query.filters.keywords.is_empty() {
            debug!("semantic_scholar: dropping unsupported journal/keyword filters");
        }
        params
    }

    fn convert_paper(record: GraphPaper) -> Result<Paper> {
        let source_id = record.paper_id.clone().ok_or_else(|| Error::Parse {
            context: "semantic_scholar paper".to_string(),
            message: "record without paperId".to_string(),
        })?;
        let title = record.title.as_deref().unwrap_or("").trim().to_string();
        if title.is_empty() {
            return Err(Error::Parse {
                context: "semantic_scholar paper".to_string(),
                message: format!("record {source_id} has no title"),
            });
        }

        let mut paper = Paper::new(ProviderName::SemanticScholar, &source_id, &title)?;
        paper.abstract_text = record.abstract_text.filter(|a| !a.trim().is_empty());
        paper.journal = record.venue.filter(|v| !v.trim().is_empty());
        paper.url = record.url;
        paper.pdf_url = record.open_access_pdf.and_then(|p| p.url);
        paper.citation_count = record.citation_count.unwrap_or(0);

        if let Some(ids) = record.external_ids {
            if let Some(doi) = ids.doi {
                paper.set_doi(&doi);
            }
            if let Some(arxiv) = ids.arxiv {
                paper.set_arxiv_id(&arxiv);
            }
        }

        paper.published_at = record
            .publication_date
            .as_deref()
            .and_then(parse_publication_date)
            .or_else(|| {
                record.year.and_then(|y| {
                    NaiveDate::from_ymd_opt(y, 1, 1)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|dt| dt.and_utc())
                })
            });

        for author in record.authors {
            if let Some(name) = author.name {
                if let Ok(author) = Author::from_name(&name) {
                    paper.authors.push(author);
                }
            }
        }

        if let Some(fields) = record.fields_of_study {
            for field in fields {
                if let Ok(category) =
                    Category::new(CategorySource::SemanticScholar, &field, &field)
                {
                    if !paper.categories.iter().any(|c| c.id == category.id) {
                        paper.categories.push(category);
                    }
                }
            }
        }

        paper.refresh_quality();
        Ok(paper)
    }
}

fn parse_publication_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[async_trait]
impl ProviderAdapter for SemanticScholarAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::SemanticScholar
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            full_text: false,
            date_filter: true,
            author_filter: true,
            category_filter: true,
            sort: false,
            max_results: 100,
            max_query_length: 300,
            rate_limit_rpm: 100,
            real_time: false,
            exact_match: false,
            fuzzy_match: true,
            wildcard: false,
            id_lookup: true,
        }
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        context: &SearchContext,
    ) -> Result<ProviderSearchResult> {
        let started = Instant::now();
        let params = Self::build_query_params(query);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/graph/v1/paper/search", self.base_url().await),
            &params,
        )
        .map_err(|e| Error::Validation {
            field: "semantic_scholar.base_url".to_string(),
            reason: e.to_string(),
        })?;
        debug!(%url, "semantic_scholar search");

        let response: GraphSearchResponse = self.get_json(url.as_str(), context).await?;
        let mut papers = Vec::with_capacity(response.data.len());
        let mut discarded = 0_u32;
        for record in response.data {
            match Self::convert_paper(record) {
                Ok(paper) => papers.push(paper),
                Err(error) => {
                    discarded += 1;
                    warn!(%error, "semantic_scholar: discarding unparsable record");
                }
            }
        }

        let has_more = response.next.is_some()
            || response
                .total
                .zip(response.offset)
                .is_some_and(|(total, offset)| offset + (papers.len() as u64) < total);

        info!(
            count = papers.len(),
            discarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "semantic_scholar search completed"
        );

        Ok(ProviderSearchResult {
            provider: ProviderName::SemanticScholar,
            papers,
            total_count: response.total,
            duration: started.elapsed(),
            request_id: generate_request_id(),
            timestamp: Utc::now(),
            success: true,
            has_more,
            discarded,
        })
    }

    async fn get_paper(&self, source_id: &str, context: &SearchContext) -> Result<Paper> {
        let url = format!(
            "{}/graph/v1/paper/{}?fields={}",
            self.base_url().await,
            urlencoding::encode(source_id),
            SEARCH_FIELDS
        );
        let record: GraphPaper = self.get_json(&url, context).await.map_err(|e| match e {
            Error::NotFound { .. } => Error::NotFound {
                resource: "paper".to_string(),
                id: format!("semantic_scholar_{source_id}"),
            },
            other => other,
        })?;
        Self::convert_paper(record)
    }

    async fn health_check(&self, context: &SearchContext) -> Result<()> {
        let url = format!(
            "{}/graph/v1/paper/search?query=test&limit=1&fields=title",
            self.base_url().await
        );
        self.get_json::<GraphSearchResponse>(&url, context)
            .await
            .map(|_| ())
            .map_err(|e| Error::HealthCheck {
                provider: ProviderName::SemanticScholar.to_string(),
                reason: e.to_string(),
            })
    }

    async fn configure(&self, settings: ProviderSettings) -> Result<()> {
        self.validate_config(&settings)?;
        *self.settings.write().await = settings;
        Ok(())
    }

    fn validate_config(&self, settings: &ProviderSettings) -> Result<()> {
        if let Some(base_url) = &settings.base_url {
            reqwest::Url::parse(base_url).map_err(|e| Error::Validation {
                field: "semantic_scholar.base_url".to_string(),
                reason: e.to_string(),
            })?;
        }
        if let Some(key) = &settings.api_key {
            if key.trim().is_empty() {
                return Err(Error::Validation {
                    field: "semantic_scholar.api_key".to_string(),
                    reason: "api key cannot be blank".to_string(),
                });
            }
        }
        Ok(())
    }
}
