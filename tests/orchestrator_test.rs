//! End-to-end orchestrator tests against fake upstream providers.

use scholar_search::bus::{subjects, BusClient, FnHandler, Message};
use scholar_search::config::Config;
use scholar_search::models::{ProviderName, SearchRequest};
use scholar_search::providers::ProviderManager;
use scholar_search::search::SearchOrchestrator;
use scholar_search::storage::Storage;
use scholar_search::{Error, ErrorClass, NoopPublisher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARXIV_THREE_ENTRIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <opensearch:totalResults>3</opensearch:totalResults>
  <entry>
    <id>http://arxiv.org/abs/2403.00001v1</id>
    <title>Graph Neural Networks for Molecules</title>
    <summary>GNNs applied to molecular property prediction.</summary>
    <published>2024-03-01T00:00:00Z</published>
    <author><name>Ada Lovelace</name></author>
    <link rel="alternate" type="text/html" href="http://arxiv.org/abs/2403.00001v1"/>
    <link title="pdf" type="application/pdf" href="http://arxiv.org/pdf/2403.00001v1"/>
    <category term="cs.LG"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2403.00002v2</id>
    <title>Sparse Graph Neural Networks</title>
    <summary>Sparsity in message passing.</summary>
    <published>2024-03-02T00:00:00Z</published>
    <author><name>Alan Turing</name></author>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2403.00003v1</id>
    <title>Graph Neural Networks Survey</title>
    <summary>A survey.</summary>
    <published>2024-03-03T00:00:00Z</published>
    <author><name>Grace Hopper</name></author>
  </entry>
</feed>"#;

const ARXIV_ATTENTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/abs/1706.03762v5</id>
    <title>Attention</title>
    <summary>The dominant sequence transduction models.</summary>
    <published>2017-06-12T00:00:00Z</published>
    <author><name>Ashish Vaswani</name></author>
    <author><name>Noam Shazeer</name></author>
    <link title="pdf" type="application/pdf" href="http://arxiv.org/pdf/1706.03762v5"/>
    <doi>10.1000/xyz</doi>
  </entry>
</feed>"#;

const S2_ATTENTION: &str = r#"{
  "total": 1,
  "offset": 0,
  "data": [{
    "paperId": "s2attention",
    "title": "Attention Is All You Need",
    "abstract": "We propose the Transformer, based solely on attention.",
    "venue": "NeurIPS",
    "year": 2017,
    "publicationDate": "2017-06-12",
    "citationCount": 90000,
    "url": "https://www.semanticscholar.org/paper/s2attention",
    "openAccessPdf": {"url": "https://example.org/attention.pdf"},
    "externalIds": {"DOI": "10.1000/XYZ"},
    "authors": [
      {"authorId": "1", "name": "Ashish Vaswani"},
      {"authorId": "2", "name": "Illia Polosukhin"}
    ]
  }]
}"#;

struct Rig {
    server: MockServer,
    orchestrator: Arc<SearchOrchestrator>,
    #[allow(dead_code)]
    bus: Option<BusClient>,
}

async fn rig(tweak: impl FnOnce(&mut Config), with_bus: bool) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let server = MockServer::start().await;

    let mut config = Config::default();
    for provider in ProviderName::ALL {
        let settings = config.providers.get_mut(provider);
        settings.base_url = Some(server.uri());
        // Tests exercise the limiter explicitly; keep it out of the way
        // everywhere else.
        settings.rate.requests_per_second = 1000;
        settings.rate.requests_per_minute = 1_000_000;
        settings.rate.burst_size = 1000;
        settings.retry.max_retries = 0;
        settings.retry.initial_delay_ms = 1;
    }
    config.providers.semantic_scholar.enabled = false;
    config.broker.enabled = false;
    tweak(&mut config);

    let providers = Arc::new(ProviderManager::from_config(&config).unwrap());
    let storage = Storage::open(&config.storage, config.search.cache_ttl()).unwrap();

    let bus = if with_bus {
        Some(BusClient::in_memory())
    } else {
        None
    };
    let publisher: Arc<dyn scholar_search::EventPublisher> = match &bus {
        Some(bus) => Arc::new(bus.clone()),
        None => Arc::new(NoopPublisher),
    };

    let orchestrator = Arc::new(SearchOrchestrator::new(
        config.search.clone(),
        providers,
        storage.cache(),
        storage.history(),
        publisher,
    ));

    Rig {
        server,
        orchestrator,
        bus,
    }
}

fn request(query: &str, providers: Vec<ProviderName>) -> SearchRequest {
    let mut request = SearchRequest::new(query);
    request.providers = Some(providers);
    request
}

#[tokio::test]
async fn preprint_search_returns_canonical_ids() {
    let rig = rig(|_| {}, false).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_THREE_ENTRIES))
        .mount(&rig.server)
        .await;

    let mut req = request("graph neural networks", vec![ProviderName::Arxiv]);
    req.limit = 3;

    let cancel = CancellationToken::new();
    let response = rig.orchestrator.search(req, &cancel).await.unwrap();

    assert_eq!(response.result_count, 3);
    let ids: Vec<&str> = response.papers.iter().map(|p| p.id.as_str()).collect();
    assert!(ids.contains(&"arxiv_2403.00001"));
    assert!(ids.contains(&"arxiv_2403.00002"));
    assert!(ids.contains(&"arxiv_2403.00003"));
    assert!(response.total_count >= 3);
    assert_eq!(response.providers_used, vec![ProviderName::Arxiv]);
    assert!(response.providers_failed.is_empty());
    assert!(!response.partial_failure);
}

#[tokio::test]
async fn authentication_failure_is_a_partial_failure() {
    let rig = rig(
        |config| {
            config.providers.exa.enabled = true;
            config.providers.exa.api_key = Some("test-key".to_string());
        },
        false,
    )
    .await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_THREE_ENTRIES))
        .mount(&rig.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&rig.server)
        .await;

    let req = request("foo", vec![ProviderName::Arxiv, ProviderName::Exa]);
    let cancel = CancellationToken::new();
    let response = rig.orchestrator.search(req, &cancel).await.unwrap();

    assert_eq!(response.providers_used, vec![ProviderName::Arxiv]);
    assert_eq!(response.providers_failed, vec![ProviderName::Exa]);
    assert!(response.partial_failure);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].class, ErrorClass::Authentication);
}

#[tokio::test]
async fn repeated_search_within_ttl_hits_the_cache() {
    let rig = rig(|_| {}, false).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_THREE_ENTRIES))
        .expect(1) // the second search must not reach upstream
        .mount(&rig.server)
        .await;

    let cancel = CancellationToken::new();
    let first = rig
        .orchestrator
        .search(
            request("attention is all you need", vec![ProviderName::Arxiv]),
            &cancel,
        )
        .await
        .unwrap();
    assert!(!first.cache_hit);

    let second = rig
        .orchestrator
        .search(
            request("attention is all you need", vec![ProviderName::Arxiv]),
            &cancel,
        )
        .await
        .unwrap();

    assert!(second.cache_hit);
    assert!(second.cache_hits >= 1);
    // The papers array replays byte-identically.
    assert_eq!(
        serde_json::to_string(&first.papers).unwrap(),
        serde_json::to_string(&second.papers).unwrap()
    );

    let stats = rig.orchestrator.cache_stats();
    assert!(stats.hits >= 1);
}

#[tokio::test]
async fn get_paper_returns_the_canonical_record() {
    let rig = rig(|_| {}, false).await;
    Mock::given(method("GET"))
        .and(query_param("id_list", "1706.03762"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_ATTENTION))
        .mount(&rig.server)
        .await;

    let cancel = CancellationToken::new();
    let paper = rig
        .orchestrator
        .get_paper(ProviderName::Arxiv, "1706.03762", &cancel)
        .await
        .unwrap();

    assert_eq!(paper.id, "arxiv_1706.03762");
    assert!(!paper.title.is_empty());
    assert!(paper.authors.len() >= 1);
}

#[tokio::test]
async fn same_doi_across_providers_merges_to_one_record() {
    let rig = rig(
        |config| {
            config.providers.semantic_scholar.enabled = true;
        },
        false,
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_ATTENTION))
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/graph/v1/paper/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(S2_ATTENTION, "application/json"),
        )
        .mount(&rig.server)
        .await;

    let req = request(
        "attention",
        vec![ProviderName::Arxiv, ProviderName::SemanticScholar],
    );
    let cancel = CancellationToken::new();
    let response = rig.orchestrator.search(req, &cancel).await.unwrap();

    assert_eq!(response.result_count, 1, "same DOI must merge to one paper");
    let paper = &response.papers[0];
    // The semantic_scholar record scores higher, so its title is the base.
    assert_eq!(paper.title, "Attention Is All You Need");
    assert_eq!(paper.doi.as_deref(), Some("10.1000/xyz"));
    // Authors are unioned by normalized name.
    let names: Vec<&str> = paper.authors.iter().map(|a| a.name.as_str()).collect();
    assert!(names.contains(&"Ashish Vaswani"));
    assert!(names.contains(&"Noam Shazeer"));
    assert!(names.contains(&"Illia Polosukhin"));
    assert_eq!(paper.authors.len(), 3);
    // The losing record's location is kept as an alternate reference.
    assert!(!paper.alternate_urls.is_empty() || paper.arxiv_id.is_some());
}

#[tokio::test]
async fn deadline_times_out_slow_providers_and_keeps_fast_ones() {
    let rig = rig(
        |config| {
            config.providers.semantic_scholar.enabled = true;
        },
        false,
    )
    .await;

    // The preprint upstream needs 600ms; the graph API answers immediately.
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(ARXIV_THREE_ENTRIES)
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/graph/v1/paper/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(S2_ATTENTION, "application/json"),
        )
        .mount(&rig.server)
        .await;

    let req = request(
        "slow upstream",
        vec![ProviderName::Arxiv, ProviderName::SemanticScholar],
    );
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let response = rig
        .orchestrator
        .search_with_deadline(req, Some(Duration::from_millis(200)), &cancel)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(500),
        "deadline must bound the response, took {elapsed:?}"
    );
    assert_eq!(response.providers_used, vec![ProviderName::SemanticScholar]);
    assert_eq!(response.providers_failed, vec![ProviderName::Arxiv]);
    assert!(response.partial_failure);
    assert!(response
        .errors
        .iter()
        .all(|e| e.class == ErrorClass::Timeout));
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_sheds_upstream_load() {
    let rig = rig(
        |config| {
            config.providers.arxiv.circuit.failure_threshold = 2;
        },
        false,
    )
    .await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&rig.server)
        .await;

    let cancel = CancellationToken::new();
    // Distinct queries keep the cache out of the way.
    for query in ["q one", "q two"] {
        let err = rig
            .orchestrator
            .search(request(query, vec![ProviderName::Arxiv]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Other);
    }
    let upstream_calls_before = rig.server.received_requests().await.unwrap().len();

    // Circuit is open: the next call must fail fast without reaching
    // upstream.
    let err = rig
        .orchestrator
        .search(request("q three", vec![ProviderName::Arxiv]), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));

    let upstream_calls_after = rig.server.received_requests().await.unwrap().len();
    assert_eq!(upstream_calls_before, upstream_calls_after);
}

#[tokio::test]
async fn exhausted_burst_returns_rate_limit_without_upstream_call() {
    let rig = rig(
        |config| {
            config.providers.arxiv.rate.requests_per_second = 1;
            config.providers.arxiv.rate.requests_per_minute = 100;
            config.providers.arxiv.rate.burst_size = 2;
            config.providers.arxiv.rate.wait_for_slot = false;
        },
        false,
    )
    .await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_THREE_ENTRIES))
        .mount(&rig.server)
        .await;

    let cancel = CancellationToken::new();
    for query in ["rate one", "rate two"] {
        rig.orchestrator
            .search(request(query, vec![ProviderName::Arxiv]), &cancel)
            .await
            .unwrap();
    }
    let upstream_calls = rig.server.received_requests().await.unwrap().len();
    assert_eq!(upstream_calls, 2);

    let err = rig
        .orchestrator
        .search(request("rate three", vec![ProviderName::Arxiv]), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::RateLimit);
    assert_eq!(rig.server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn search_lifecycle_events_reach_the_bus() {
    let rig = rig(|_| {}, true).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_THREE_ENTRIES))
        .mount(&rig.server)
        .await;

    let bus = rig.bus.as_ref().unwrap();
    let seen = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
    for pattern in ["search.*", "papers.*"] {
        let seen = seen.clone();
        bus.subscribe(
            pattern,
            Arc::new(FnHandler(move |message: Message| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(message.subject);
                    Ok(())
                }
            })),
        )
        .await
        .unwrap();
    }

    let cancel = CancellationToken::new();
    rig.orchestrator
        .search(request("events", vec![ProviderName::Arxiv]), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = seen.lock().await;
    assert!(seen.contains(&subjects::SEARCH_REQUEST.to_string()));
    assert!(seen.contains(&subjects::SEARCH_COMPLETED.to_string()));
    assert!(seen.contains(&subjects::PAPERS_INDEXED.to_string()));
}

#[tokio::test]
async fn oversized_limit_fails_validation_before_fan_out() {
    let rig = rig(|_| {}, false).await;
    // No mock mounted: validation must fail before any upstream call.
    let mut req = request("query", vec![ProviderName::Arxiv]);
    req.limit = 101;

    let cancel = CancellationToken::new();
    let err = rig.orchestrator.search(req, &cancel).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(rig.server.received_requests().await.unwrap().is_empty());
}
