use super::traits::{
    classify_status, truncate_excerpt, ProviderAdapter, ProviderCapabilities, ProviderQuery,
    ProviderSearchResult, SearchContext,
};
use super::{url_source_id, SCHOLARLY_DOMAINS};
use crate::config::ProviderSettings;
use crate::models::{generate_request_id, Author, Paper, ProviderName};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.exa.ai";
const ABSTRACT_MAX_CHARS: usize = 1500;

/// Neural web-search provider restricted to scholarly hosts.
pub struct ExaAdapter {
    client: Client,
    settings: RwLock<ProviderSettings>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaSearchBody<'a> {
    query: &'a str,
    num_results: u32,
    #[serde(rename = "type")]
    search_type: &'a str,
    include_domains: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    start_published_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_published_date: Option<String>,
    contents: ExaContentsSpec,
}

#[derive(Debug, Serialize)]
struct ExaContentsSpec {
    text: ExaTextSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaTextSpec {
    max_characters: usize,
}

#[derive(Debug, Deserialize)]
struct ExaSearchResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Debug, Deserialize)]
struct ExaResult {
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default, rename = "publishedDate")]
    published_date: Option<String>,
    #[serde(default)]
    author: Option<String>,
    /// Neural relevance score, used as the paper's initial quality.
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    text: Option<String>,
}

impl ExaAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(super::traits::USER_AGENT)
            .build()
            .map_err(|e| Error::Network {
                message: format!("failed to build exa HTTP client: {e}"),
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
            .ok_or_else(|| Error::Authentication("exa: no API key configured".to_string()))
    }

    fn convert_result(result: ExaResult) -> Result<Paper> {
        let title = result.title.as_deref().unwrap_or("").trim().to_string();
        if title.is_empty() {
            return Err(Error::Parse {
                context: "exa result".to_string(),
                message: format!("result {} has no title", result.url),
            });
        }

        let source_id = url_source_id(&result.url);
        let mut paper = Paper::new(ProviderName::Exa, &source_id, &title)?;
        paper.url = Some(result.url.clone());
        paper.published_at = result
            .published_date
            .as_deref()
            .and_then(parse_loose_date);
        if let Some(author) = result.author.as_deref().filter(|a| !a.trim().is_empty()) {
            if let Ok(author) = Author::from_name(author) {
                paper.authors.push(author);
            }
        }
        if let Some(text) = result.text.as_deref().filter(|t| !t.trim().is_empty()) {
            paper.abstract_text = Some(truncate_excerpt(text, ABSTRACT_MAX_CHARS));
        }

        paper.refresh_quality();
        // The upstream relevance score is the initial quality signal.
        if let Some(score) = result.score {
            paper.quality_score = score.clamp(0.0, 1.0);
        }
        Ok(paper)
    }
}

fn parse_loose_date(raw: &str) -> Option<DateTime<Utc>> {
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
impl ProviderAdapter for ExaAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Exa
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            full_text: false,
            date_filter: true,
            author_filter: false,
            category_filter: false,
            sort: false,
            max_results: 100,
            max_query_length: 2000,
            rate_limit_rpm: 60,
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

        if !query.filters.is_empty() {
            debug!("exa: dropping structured filters not covered by capabilities");
        }

        let body = ExaSearchBody {
            query: &query.query,
            num_results: query.limit,
            search_type: "neural",
            include_domains: SCHOLARLY_DOMAINS,
            start_published_date: query.date_from.map(|d| d.to_rfc3339()),
            end_published_date: query.date_to.map(|d| d.to_rfc3339()),
            contents: ExaContentsSpec {
                text: ExaTextSpec {
                    max_characters: ABSTRACT_MAX_CHARS,
                },
            },
        };

        let url = format!("{}/search", self.base_url().await);
        debug!(%url, "exa search");
        let mut request = self
            .client
            .post(&url)
            .timeout(context.timeout)
            .header("x-api-key", api_key)
            .json(&body);
        for (key, value) in &context.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(Error::from)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(ProviderName::Exa, status, &body));
        }
        let parsed: ExaSearchResponse = response.json().await.map_err(|e| Error::Parse {
            context: "exa response".to_string(),
            message: e.to_string(),
        })?;

        let mut papers = Vec::with_capacity(parsed.results.len());
        let mut discarded = 0_u32;
        for result in parsed.results {
            match Self::convert_result(result) {
                Ok(paper) => papers.push(paper),
                Err(error) => {
                    discarded += 1;
                    warn!(%error, "exa: discarding unparsable result");
                }
            }
        }

        let has_more = papers.len() as u32 >= query.limit;
        let total_count = Some(papers.len() as u64);
        info!(
            count = papers.len(),
            discarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exa search completed"
        );

        Ok(ProviderSearchResult {
            provider: ProviderName::Exa,
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
        // Web results have no stable upstream id to look up again.
        Err(Error::NotFound {
            resource: "paper".to_string(),
            id: format!("exa_{source_id}"),
        })
    }

    async fn health_check(&self, context: &SearchContext) -> Result<()> {
        let query = ProviderQuery {
            query: "machine learning".to_string(),
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
                provider: ProviderName::Exa.to_string(),
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
                field: "exa.api_key".to_string(),
                reason: "an API key is required when the provider is enabled".to_string(),
            });
        }
        if let Some(base_url) = &settings.base_url {
            reqwest::Url::parse(base_url).map_err(|e| Error::Validation {
                field: "exa.base_url".to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_converts_with_score_as_quality() {
        let result: ExaResult = serde_json::from_str(
            r#"{
                "title": "Attention Is All You Need",
                "url": "https://arxiv.org/abs/1706.03762",
                "publishedDate": "2017-06-12T00:00:00.000Z",
                "author": "Ashish Vaswani",
                "score": 0.87,
                "text": "The dominant sequence transduction models are based on..."
            }"#,
        )
        .unwrap();

        let paper = ExaAdapter::convert_result(result).unwrap();
        assert!(paper.id.starts_with("exa_"));
        assert_eq!(paper.source_provider, ProviderName::Exa);
        assert!((paper.quality_score - 0.87).abs() < f64::EPSILON);
        assert_eq!(paper.authors.len(), 1);
        assert!(paper.abstract_text.is_some());
    }

    #[test]
    fn titleless_result_is_discarded() {
        let result: ExaResult =
            serde_json::from_str(r#"{"url": "https://arxiv.org/abs/1"}"#).unwrap();
        assert!(ExaAdapter::convert_result(result).is_err());
    }

    #[test]
    fn long_text_is_truncated_with_marker() {
        let result: ExaResult = serde_json::from_str(&format!(
            r#"{{"title": "T", "url": "https://nature.com/x", "text": "{}"}}"#,
            "w".repeat(2000)
        ))
        .unwrap();
        let paper = ExaAdapter::convert_result(result).unwrap();
        let abstract_text = paper.abstract_text.unwrap();
        assert!(abstract_text.chars().count() <= ABSTRACT_MAX_CHARS + 1);
        assert!(abstract_text.ends_with('…'));
    }

    #[tokio::test]
    async fn search_without_key_fails_authentication() {
        let adapter = ExaAdapter::new(ProviderSettings::default()).unwrap();
        let query = ProviderQuery {
            query: "test".to_string(),
            limit: 1,
            offset: 0,
            date_from: None,
            date_to: None,
            filters: Default::default(),
            sort_by: Default::default(),
            sort_order: Default::default(),
        };
        let err = adapter
            .search(&query, &SearchContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Authentication);
    }
}
