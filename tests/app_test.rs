//! Wiring tests: the full application graph and the tool-call contract.

use scholar_search::bus::subjects;
use scholar_search::config::Config;
use scholar_search::models::ProviderName;
use scholar_search::tools::{ToolRequest, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
use scholar_search::App;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARXIV_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/abs/2403.00001v1</id>
    <title>A Paper</title>
    <summary>Summary.</summary>
    <published>2024-03-01T00:00:00Z</published>
    <author><name>Ada Lovelace</name></author>
  </entry>
</feed>"#;

async fn app(server: &MockServer) -> App {
    let mut config = Config::default();
    for provider in ProviderName::ALL {
        let settings = config.providers.get_mut(provider);
        settings.base_url = Some(server.uri());
        settings.rate.requests_per_second = 1000;
        settings.rate.requests_per_minute = 1_000_000;
        settings.rate.burst_size = 1000;
        settings.retry.max_retries = 0;
    }
    config.providers.semantic_scholar.enabled = false;
    let store = tempfile::tempdir().unwrap();
    config.broker.store_dir = Some(store.keep());
    App::build(config).await.unwrap()
}

#[tokio::test]
async fn tool_calls_round_trip_over_the_bus() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARXIV_FEED))
        .mount(&server)
        .await;

    let app = app(&server).await;
    let bus = app.bus.as_ref().unwrap();

    let reply = bus
        .request(
            subjects::TOOLS_REQUEST,
            &serde_json::json!({
                "method": "search",
                "params": {"query": "a paper", "providers": ["arxiv"], "limit": 5}
            }),
        )
        .await
        .unwrap();

    let result = &reply.payload["result"];
    assert_eq!(result["providers_used"][0], "arxiv");
    assert_eq!(result["papers"][0]["id"], "arxiv_2403.00001");

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn facade_maps_errors_to_the_envelope_codes() {
    let server = MockServer::start().await;
    let app = app(&server).await;

    let response = app.facade.dispatch_raw(b"{not json").await;
    assert_eq!(response.error.unwrap().code, PARSE_ERROR);

    let response = app
        .facade
        .dispatch(ToolRequest {
            method: "unknown_method".to_string(),
            params: serde_json::Value::Null,
        })
        .await;
    assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

    let response = app
        .facade
        .dispatch(ToolRequest {
            method: "search".to_string(),
            params: serde_json::json!({"query": "x", "providers": ["bogus"]}),
        })
        .await;
    assert_eq!(response.error.unwrap().code, INVALID_PARAMS);

    let response = app
        .facade
        .dispatch(ToolRequest {
            method: "search".to_string(),
            params: serde_json::json!({"query": "x", "limit": 9999}),
        })
        .await;
    assert_eq!(response.error.unwrap().code, INVALID_PARAMS);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn ping_capabilities_and_schemas_are_served() {
    let server = MockServer::start().await;
    let app = app(&server).await;

    let pong = app
        .facade
        .dispatch(ToolRequest {
            method: "ping".to_string(),
            params: serde_json::Value::Null,
        })
        .await;
    assert!(pong.result.unwrap()["pong"].as_i64().unwrap() > 0);

    let capabilities = app
        .facade
        .dispatch(ToolRequest {
            method: "list_capabilities".to_string(),
            params: serde_json::Value::Null,
        })
        .await;
    let result = capabilities.result.unwrap();
    assert!(result["arxiv"]["id_lookup"].as_bool().unwrap());
    assert!(!result["tavily"]["id_lookup"].as_bool().unwrap());

    let schema = app
        .facade
        .dispatch(ToolRequest {
            method: "get_schema".to_string(),
            params: serde_json::json!({"schema": "paper"}),
        })
        .await;
    assert!(schema.result.is_some());

    let unknown = app
        .facade
        .dispatch(ToolRequest {
            method: "get_schema".to_string(),
            params: serde_json::json!({"schema": "nope"}),
        })
        .await;
    assert_eq!(unknown.error.unwrap().code, INVALID_PARAMS);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let server = MockServer::start().await;
    let app = app(&server).await;
    app.shutdown().await.unwrap();
    app.shutdown().await.unwrap();
}
