use super::aggregate;
use crate::bus::{publish_json, subjects, EventPublisher};
use crate::config::SearchSettings;
use crate::events::{PaperIndexed, SearchAnalytics, SearchCacheHit, SearchCompleted, SearchRequested};
use crate::models::{
    query_fingerprint, Paper, ProviderFailure, ProviderName, SearchRequest, SearchResponse,
};
use crate::providers::{ProviderManager, ProviderQuery, ProviderSearchResult};
use crate::storage::{HistoryRecord, SearchCache, SearchHistory};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// The federated search orchestrator: provider selection, cache probe,
/// bounded concurrent fan-out, aggregation and event publication.
///
/// Depends only on the [`EventPublisher`] capability, never on the broker.
pub struct SearchOrchestrator {
    settings: SearchSettings,
    providers: Arc<ProviderManager>,
    cache: Arc<SearchCache>,
    history: Arc<SearchHistory>,
    publisher: Arc<dyn EventPublisher>,
    /// Global bound on concurrent provider calls across requests.
    semaphore: Arc<Semaphore>,
}

impl SearchOrchestrator {
    #[must_use]
    pub fn new(
        settings: SearchSettings,
        providers: Arc<ProviderManager>,
        cache: Arc<SearchCache>,
        history: Arc<SearchHistory>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrency));
        Self {
            settings,
            providers,
            cache,
            history,
            publisher,
            semaphore,
        }
    }

    /// Execute a search under the configured hard deadline.
    pub async fn search(
        &self,
        request: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        self.search_with_deadline(request, None, cancel).await
    }

    /// Execute a search; the effective deadline is the minimum of the
    /// client deadline and the configured ceiling.
    #[instrument(skip(self, request, cancel), fields(query = %request.query))]
    pub async fn search_with_deadline(
        &self,
        mut request: SearchRequest,
        client_deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        request.validate()?;

        let selected = self.select_providers(&request)?;
        let fingerprint = query_fingerprint(&request);

        if let Some(response) = self.probe_cache(&request, &fingerprint, &selected).await? {
            return Ok(response);
        }

        self.publish_event(
            subjects::SEARCH_REQUEST,
            &SearchRequested {
                request_id: request.request_id.clone(),
                query: request.query.clone(),
                providers: selected.clone(),
                user_id: request.user_id.clone(),
                client_ip: request.client_ip.clone(),
                user_agent: request.user_agent.clone(),
                timestamp_ms: crate::bus::now_ms(),
            },
        )
        .await;

        let deadline = client_deadline
            .map_or(self.settings.request_timeout(), |d| {
                d.min(self.settings.request_timeout())
            });

        let (successes, failures) = self
            .fan_out(&request, &selected, deadline, started, cancel)
            .await?;

        if successes.is_empty() {
            let error = most_severe(failures);
            self.publish_event(
                subjects::SEARCH_COMPLETED,
                &SearchCompleted {
                    request_id: request.request_id.clone(),
                    query: request.query.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    providers_used: vec![],
                    providers_failed: selected.clone(),
                    cache_hit: false,
                    result_count: 0,
                    success: false,
                    error: Some(error.to_string()),
                    timestamp_ms: crate::bus::now_ms(),
                },
            )
            .await;
            return Err(error);
        }

        let response = self.build_response(&request, &selected, started, successes, &failures);

        self.cache_response(&request, &fingerprint, &response);
        self.publish_completion(&request, &response).await;
        self.append_history(&request, &response);

        Ok(response)
    }

    /// Fetch one paper through the envelope-wrapped adapter.
    pub async fn get_paper(
        &self,
        provider: ProviderName,
        source_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Paper> {
        // Accept canonical `<provider>_<sourceId>` ids as well.
        let source_id = source_id
            .strip_prefix(&format!("{provider}_"))
            .unwrap_or(source_id);
        let wrapped = self.providers.get(provider)?;
        let timeout = wrapped.timeout().await;
        wrapped.get_paper(source_id, timeout, cancel).await
    }

    #[must_use]
    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    #[must_use]
    pub fn cache_stats(&self) -> crate::storage::CacheStats {
        self.cache.stats()
    }

    fn select_providers(&self, request: &SearchRequest) -> Result<Vec<ProviderName>> {
        let selected = match &request.providers {
            Some(subset) => {
                let mut unique = Vec::new();
                for provider in subset {
                    if !unique.contains(provider) {
                        unique.push(*provider);
                    }
                }
                unique
            }
            None => self.providers.enabled_providers(),
        };
        if selected.is_empty() {
            return Err(Error::Validation {
                field: "providers".to_string(),
                reason: "no providers are enabled for this search".to_string(),
            });
        }
        Ok(selected)
    }

    async fn probe_cache(
        &self,
        request: &SearchRequest,
        fingerprint: &str,
        selected: &[ProviderName],
    ) -> Result<Option<SearchResponse>> {
        let Some(entry) = self.cache.get(fingerprint)? else {
            return Ok(None);
        };

        let mut response: SearchResponse = serde_json::from_slice(&entry.response_json)?;
        response.cache_hit = true;
        response.cache_hits = entry.access_count;
        response.request_id = request.request_id.clone();

        for provider in selected {
            if let Ok(wrapped) = self.providers.get(*provider) {
                wrapped.record_cached().await;
            }
        }

        self.publish_event(
            subjects::SEARCH_CACHED,
            &SearchCacheHit {
                request_id: request.request_id.clone(),
                fingerprint: fingerprint.to_string(),
                query: request.query.clone(),
                cache_hits: entry.access_count,
                timestamp_ms: crate::bus::now_ms(),
            },
        )
        .await;

        debug!(fingerprint, "search served from cache");
        Ok(Some(response))
    }

    /// Concurrent fan-out over the selected providers. Returns successes in
    /// completion order plus per-provider failures; sibling failures never
    /// abort the orchestration.
    async fn fan_out(
        &self,
        request: &SearchRequest,
        selected: &[ProviderName],
        deadline: Duration,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ProviderSearchResult>, Vec<(ProviderName, Error)>)> {
        let child_cancel = cancel.child_token();
        let deadline_at = started + deadline;
        let mut join_set: JoinSet<(ProviderName, Result<ProviderSearchResult>)> = JoinSet::new();

        for name in selected.iter().copied() {
            let provider = self.providers.get(name)?;
            let query = ProviderQuery::from_request(request);
            let semaphore = self.semaphore.clone();
            let task_cancel = child_cancel.clone();

            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                if permit.is_err() {
                    return (
                        name,
                        Err(Error::other("search concurrency pool closed")),
                    );
                }

                let now = Instant::now();
                let remaining = deadline_at.saturating_duration_since(now);
                if remaining.is_zero() {
                    return (
                        name,
                        Err(Error::Timeout {
                            operation: format!("{name}.search"),
                            timeout: Duration::ZERO,
                        }),
                    );
                }
                let per_call = remaining.min(provider.timeout().await);

                let outcome = tokio::select! {
                    () = task_cancel.cancelled() => Err(Error::Timeout {
                        operation: format!("{name}.search"),
                        timeout: per_call,
                    }),
                    result = tokio::time::timeout(per_call, provider.search(&query, per_call, &task_cancel)) => {
                        match result {
                            Ok(inner) => inner,
                            Err(_) => Err(Error::Timeout {
                                operation: format!("{name}.search"),
                                timeout: per_call,
                            }),
                        }
                    }
                };
                (name, outcome)
            });
        }

        let mut successes: Vec<ProviderSearchResult> = Vec::new();
        let mut failures: Vec<(ProviderName, Error)> = Vec::new();
        let mut completed: HashSet<ProviderName> = HashSet::new();

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let collection = tokio::time::timeout(remaining, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(result))) => {
                        completed.insert(name);
                        debug!(provider = %name, count = result.papers.len(), "provider succeeded");
                        successes.push(result);
                    }
                    Ok((name, Err(error))) => {
                        completed.insert(name);
                        warn!(provider = %name, %error, "provider failed");
                        failures.push((name, error));
                    }
                    Err(join_error) => {
                        warn!(%join_error, "provider task panicked");
                    }
                }
            }
        })
        .await;

        if collection.is_err() {
            // Deadline fired: cancel stragglers and discard their results.
            child_cancel.cancel();
            join_set.abort_all();
            for name in selected {
                if !completed.contains(name) {
                    warn!(provider = %name, "provider missed the request deadline");
                    failures.push((
                        *name,
                        Error::Timeout {
                            operation: format!("{name}.search"),
                            timeout: deadline,
                        },
                    ));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::other("search cancelled by caller"));
        }

        Ok((successes, failures))
    }

    fn build_response(
        &self,
        request: &SearchRequest,
        selected: &[ProviderName],
        started: Instant,
        successes: Vec<ProviderSearchResult>,
        failures: &[(ProviderName, Error)],
    ) -> SearchResponse {
        let succeeded: HashSet<ProviderName> = successes.iter().map(|r| r.provider).collect();
        let providers_used: Vec<ProviderName> = selected
            .iter()
            .copied()
            .filter(|p| succeeded.contains(p))
            .collect();
        let providers_failed: Vec<ProviderName> = selected
            .iter()
            .copied()
            .filter(|p| !succeeded.contains(p))
            .collect();

        let total_count: u64 = successes
            .iter()
            .map(|r| r.total_count.unwrap_or(r.papers.len() as u64))
            .sum();

        let papers = aggregate::aggregate(request, selected, &successes);
        let errors: Vec<ProviderFailure> = failures
            .iter()
            .map(|(provider, error)| ProviderFailure {
                provider: *provider,
                class: error.class(),
                message: error.to_string(),
            })
            .collect();

        let partial_failure = !providers_failed.is_empty() && !providers_used.is_empty();
        SearchResponse {
            request_id: request.request_id.clone(),
            result_count: papers.len() as u32,
            papers,
            total_count,
            providers_used,
            providers_failed,
            duration_ms: started.elapsed().as_millis() as u64,
            strategy: request.strategy,
            cache_hit: false,
            cache_hits: 0,
            partial_failure,
            errors,
        }
    }

    fn cache_response(&self, request: &SearchRequest, fingerprint: &str, response: &SearchResponse) {
        match serde_json::to_vec(response) {
            Ok(bytes) => {
                if let Err(err) = self.cache.set(
                    fingerprint,
                    &request.query,
                    bytes,
                    response.result_count,
                    response.providers_used.clone(),
                    None,
                ) {
                    warn!(%err, "failed to cache search response");
                }
            }
            Err(err) => warn!(%err, "failed to serialize response for caching"),
        }
    }

    async fn publish_completion(&self, request: &SearchRequest, response: &SearchResponse) {
        self.publish_event(
            subjects::SEARCH_COMPLETED,
            &SearchCompleted {
                request_id: response.request_id.clone(),
                query: request.query.clone(),
                duration_ms: response.duration_ms,
                providers_used: response.providers_used.clone(),
                providers_failed: response.providers_failed.clone(),
                cache_hit: false,
                result_count: response.result_count,
                success: true,
                error: None,
                timestamp_ms: crate::bus::now_ms(),
            },
        )
        .await;

        self.publish_event(
            subjects::SEARCH_ANALYTICS,
            &SearchAnalytics {
                request_id: response.request_id.clone(),
                query: request.query.clone(),
                filters: request.filters.clone(),
                result_count: response.result_count,
                duration_ms: response.duration_ms,
                timestamp_ms: crate::bus::now_ms(),
            },
        )
        .await;

        // Merged papers flow onto the durable indexing stream.
        for paper in &response.papers {
            self.publish_event(
                subjects::PAPERS_INDEXED,
                &PaperIndexed {
                    event_id: uuid::Uuid::new_v4().to_string(),
                    paper_id: paper.id.clone(),
                    provider: paper.source_provider,
                    quality_score: paper.quality_score,
                    timestamp_ms: crate::bus::now_ms(),
                },
            )
            .await;
        }
    }

    /// History writes are best-effort and never block the response.
    fn append_history(&self, request: &SearchRequest, response: &SearchResponse) {
        let history = self.history.clone();
        let record = HistoryRecord {
            id: 0,
            query: request.query.clone(),
            user_id: request.user_id.clone(),
            result_count: response.result_count,
            duration_ms: response.duration_ms,
            providers: response.providers_used.clone(),
            filters_json: serde_json::to_string(&request.filters)
                .unwrap_or_else(|_| "{}".to_string()),
            requested_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(err) = history.append(record) {
                warn!(%err, "failed to append search history");
            }
        });
    }

    /// Publish failures never fail the user-visible operation.
    async fn publish_event<T: Serialize>(&self, subject: &str, event: &T) {
        if let Err(err) = publish_json(self.publisher.as_ref(), subject, event).await {
            warn!(subject, %err, "event publish failed");
        }
    }
}

/// Pick the most severe error by class; ties keep the first observed.
fn most_severe(failures: Vec<(ProviderName, Error)>) -> Error {
    failures
        .into_iter()
        .map(|(_, error)| error)
        .max_by_key(|error| error.class().severity())
        .unwrap_or_else(|| Error::other("all providers failed"))
}
