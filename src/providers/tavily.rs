use super::traits::{
    classify_status, truncate_excerpt, ProviderAdapter, ProviderCapabilities, ProviderQuery,
    ProviderSearchResult, SearchContext,
};
use super::{url_source_id, SCHOLARLY_DOMAINS};
use crate::config::ProviderSettings;
use crate::models::{generate_request_id, Paper, ProviderName};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";
const EXCERPT_MAX_CHARS: usize = 1000;

/// General web-search provider with advanced search depth, restricted to
/// scholarly hosts.
pub struct TavilyAdapter {
    client: Client,
    settings: RwLock<ProviderSettings>,
}

#[derive(Debug, Serialize)]
struct TavilySearchBody<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: u32,
    include_domains: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: Option<String>,
    url: String,
    /// Content excerpt; truncated before it becomes the abstract.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    published_date: Option<String>,
}

impl TavilyAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(super::traits::USER_AGENT)
            .build()
            .map_err(|e| Error::Network {
                message: format!("failed to build tavily HTTP client: {e}"),
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

    async fn api_key(&self) -> Result<String> {
        self.settings
            .read()
            .await
            .api_key
            .clone()
            .ok_or_else(|| Error::Authentication("tavily: no API key configured".to_string()))
    }

    fn convert_result(result: TavilyResult) -> Result<Paper> {
        let title = result.title.as_deref().unwrap_or("").trim().to_string();
        if title.is_empty() {
            return Err(Error::Parse {
                context: "tavily result".to_string(),
                message: format!("result {} has no title", result.url),
            });
        }

        let source_id = url_source_id(&result.url);
        let mut paper = Paper::new(ProviderName::Tavily, &source_id, &title)?;
        paper.url = Some(result.url.clone());
        paper.published_at = result.published_date.as_deref().and_then(parse_date);
        if let Some(content) = result.content.as_deref().filter(|c| !c.trim().is_empty()) {
            paper.abstract_text = Some(truncate_excerpt(content, EXCERPT_MAX_CHARS));
        }

        paper.refresh_quality();
        if let Some(score) = result.score {
            paper.quality_score = score.clamp(0.0, 1.0);
        }
        Ok(paper)
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

#[async_trait]
impl ProviderAdapter for TavilyAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Tavily
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            full_text: false,
            date_filter: false,
            author_filter: false,
            category_filter: false,
            sort: false,
            max_results: 20,
            max_query_length: 400,
            rate_limit_rpm: 100,
            real_time: true,
            exact_match: false,
            fuzzy_match: true,
            wildcard: false,
            id_lookup: false,
        }
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        context: &SearchContext,
    ) -> Result<ProviderSearchResult> {
        let started = Instant::now();
        let api_key = self.api_key().await?;

        if !query.filters.is_empty() || query.date_from.is_some() || query.date_to.is_some() {
            debug!("tavily: dropping filters not covered by capabilities");
        }

        let body = TavilySearchBody {
            api_key: &api_key,
            query: &query.query,
            search_depth: "advanced",
            max_results: query.limit.min(self.capabilities().max_results),
            include_domains: SCHOLARLY_DOMAINS,
        };

        let url = format!("{}/search", self.base_url().await);
        debug!(%url, "tavily search");
        let mut request = self.client.post(&url).timeout(context.timeout).json(&body);
        for (key, value) in &context.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(Error::from)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(ProviderName::Tavily, status, &body));
        }
        let parsed: TavilySearchResponse = response.json().await.map_err(|e| Error::Parse {
            context: "tavily response".to_string(),
            message: e.to_string(),
        })?;

        let mut papers = Vec::with_capacity(parsed.results.len());
        let mut discarded = 0_u32;
        for result in parsed.results {
            match Self::convert_result(result) {
                Ok(paper) => papers.push(paper),
                Err(error) => {
                    discarded += 1;
                    warn!(%error, "tavily: discarding unparsable result");
                }
            }
        }

        let has_more = papers.len() as u32 >= query.limit;
        let total_count = Some(papers.len() as u64);
        info!(
            count = papers.len(),
            discarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tavily search completed"
        );

        Ok(ProviderSearchResult {
            provider: ProviderName::Tavily,
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

    async fn get_paper(&self, source_id: &str, _context: &SearchContext) -> Result<Paper> {
        Err(Error::NotFound {
            resource: "paper".to_string(),
            id: format!("tavily_{source_id}"),
        })
    }

    async fn health_check(&self, context: &SearchContext) -> Result<()> {
        let query = ProviderQuery {
            query: "research".to_string(),
            limit: 1,
            offset: 0,
            date_from: None,
            date_to: None,
            filters: Default::default(),
            sort_by: Default::default(),
            sort_order: Default::default(),
        };
        self.search(&query, context)
            .await
            .map(|_| ())
            .map_err(|e| Error::HealthCheck {
                provider: ProviderName::Tavily.to_string(),
                reason: e.to_string(),
            })
    }

    async fn configure(&self, settings: ProviderSettings) -> Result<()> {
        self.validate_config(&settings)?;
        *self.settings.write().await = settings;
        Ok(())
    }

    fn validate_config(&self, settings: &ProviderSettings) -> Result<()> {
        if settings.enabled && settings.api_key.is_none() {
            return Err(Error::Validation {
                field: "tavily.api_key".to_string(),
                reason: "an API key is required when the provider is enabled".to_string(),
            });
        }
        if let Some(base_url) = &settings.base_url {
            reqwest::Url::parse(base_url).map_err(|e| Error::Validation {
                field: "tavily.base_url".to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
