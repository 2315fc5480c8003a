use crate::bus::{subjects, BusClient, FnHandler, Message};
use crate::error::ErrorClass;
use crate::models::{
    Paper, ProviderName, SearchFilters, SearchRequest, SearchResponse,
};
use crate::search::SearchOrchestrator;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// JSON-RPC style error codes used by the tool contract.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Incoming tool call: method name plus free-form params.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Tool call outcome: exactly one of result/error is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(result) => Self {
                result: Some(result),
                error: None,
            },
            Err(err) => Self::error(INTERNAL_ERROR, format!("serialization failed: {err}"), None),
        }
    }

    fn error(code: i32, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            result: None,
            error: Some(ToolError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// Parameters for the `search` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchToolInput {
    pub query: String,
    /// Provider subset, snake_case names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<SearchFilters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// Parameters for the `get_paper` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetPaperInput {
    /// Canonical `<provider>_<sourceId>` id, or a bare source id when
    /// `provider` is given.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Thin typed facade exposing search and get-paper as tool calls over a
/// JSON request/response protocol, bridged onto the bus.
pub struct ToolFacade {
    orchestrator: Arc<SearchOrchestrator>,
}

impl ToolFacade {
    #[must_use]
    pub fn new(orchestrator: Arc<SearchOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Parse raw JSON and dispatch. Never returns a transport error; every
    /// failure is expressed in the error envelope.
    pub async fn dispatch_raw(&self, raw: &[u8]) -> ToolResponse {
        match serde_json::from_slice::<ToolRequest>(raw) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => ToolResponse::error(PARSE_ERROR, format!("invalid JSON: {err}"), None),
        }
    }

    /// Method-dispatched tool invocation.
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        debug!("tool call received");
        match request.method.as_str() {
            "search" => self.handle_search(request.params).await,
            "get_paper" => self.handle_get_paper(request.params).await,
            "list_capabilities" => self.handle_list_capabilities(),
            "get_schema" => Self::handle_get_schema(&request.params),
            "ping" => ToolResponse::ok(&serde_json::json!({"pong": crate::bus::now_ms()})),
            other => ToolResponse::error(
                METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
                None,
            ),
        }
    }

    /// Register the facade on the bus: a queue subscription answering tool
    /// requests over their reply subjects.
    pub async fn attach(self: Arc<Self>, bus: &BusClient) -> Result<u64> {
        let facade = self;
        let responder = bus.clone();
        let id = bus
            .queue_subscribe(
                subjects::TOOLS_REQUEST,
                "tools",
                Arc::new(FnHandler(move |message: Message| {
                    let facade = facade.clone();
                    let responder = responder.clone();
                    async move {
                        let request: ToolRequest = match serde_json::from_value(message.payload.clone())
                        {
                            Ok(request) => request,
                            Err(err) => {
                                let response = ToolResponse::error(
                                    INVALID_REQUEST,
                                    format!("malformed tool request: {err}"),
                                    None,
                                );
                                return responder.respond(&message, &response).await;
                            }
                        };
                        let response = facade.dispatch(request).await;
                        responder.respond(&message, &response).await
                    }
                })),
            )
            .await?;
        info!("tool facade attached to the bus");
        Ok(id)
    }

    async fn handle_search(&self, params: serde_json::Value) -> ToolResponse {
        let input: SearchToolInput = match serde_json::from_value(params) {
            Ok(input) => input,
            Err(err) => {
                return ToolResponse::error(INVALID_PARAMS, format!("bad params: {err}"), None)
            }
        };

        let mut request = SearchRequest::new(input.query);
        if let Some(limit) = input.limit {
            request.limit = limit;
        }
        if let Some(offset) = input.offset {
            request.offset = offset;
        }
        if let Some(filters) = input.filters {
            request.filters = filters;
        }
        if let Some(providers) = input.providers {
            let mut parsed = Vec::with_capacity(providers.len());
            for raw in providers {
                match ProviderName::from_str(&raw) {
                    Ok(provider) => parsed.push(provider),
                    Err(err) => {
                        return ToolResponse::error(
                            INVALID_PARAMS,
                            err.to_string(),
                            Some(serde_json::json!({"provider": raw})),
                        )
                    }
                }
            }
            request.providers = Some(parsed);
        }

        let cancel = CancellationToken::new();
        match self.orchestrator.search(request, &cancel).await {
            Ok(response) => ToolResponse::ok::<SearchResponse>(&response),
            Err(error) => domain_error(&error),
        }
    }

    async fn handle_get_paper(&self, params: serde_json::Value) -> ToolResponse {
        let input: GetPaperInput = match serde_json::from_value(params) {
            Ok(input) => input,
            Err(err) => {
                return ToolResponse::error(INVALID_PARAMS, format!("bad params: {err}"), None)
            }
        };

        let (provider, source_id) = match resolve_paper_id(&input) {
            Ok(pair) => pair,
            Err(error) => return domain_error(&error),
        };

        let cancel = CancellationToken::new();
        match self
            .orchestrator
            .get_paper(provider, &source_id, &cancel)
            .await
        {
            Ok(paper) => ToolResponse::ok::<Paper>(&paper),
            Err(error) => domain_error(&error),
        }
    }

    fn handle_list_capabilities(&self) -> ToolResponse {
        let capabilities = self.orchestrator.providers().capabilities();
        let map: std::collections::BTreeMap<String, _> = capabilities
            .into_iter()
            .map(|(name, caps)| (name.to_string(), caps))
            .collect();
        ToolResponse::ok(&map)
    }

    fn handle_get_schema(params: &serde_json::Value) -> ToolResponse {
        let Some(name) = params.get("schema").and_then(serde_json::Value::as_str) else {
            return ToolResponse::error(INVALID_PARAMS, "missing 'schema' param", None);
        };
        let schema = match name {
            "search_request" => serde_json::to_value(schemars::schema_for!(SearchRequest)),
            "search_input" => serde_json::to_value(schemars::schema_for!(SearchToolInput)),
            "get_paper_input" => serde_json::to_value(schemars::schema_for!(GetPaperInput)),
            "paper" => serde_json::to_value(schemars::schema_for!(Paper)),
            "provider_capabilities" => serde_json::to_value(schemars::schema_for!(
                crate::providers::ProviderCapabilities
            )),
            other => {
                return ToolResponse::error(
                    INVALID_PARAMS,
                    format!("unknown schema '{other}'"),
                    None,
                )
            }
        };
        match schema {
            Ok(value) => ToolResponse::ok(&value),
            Err(err) => ToolResponse::error(INTERNAL_ERROR, err.to_string(), None),
        }
    }
}

/// Resolve provider and source id from the input, accepting either a
/// canonical id or an explicit provider plus bare id.
fn resolve_paper_id(input: &GetPaperInput) -> Result<(ProviderName, String)> {
    if let Some(raw) = &input.provider {
        return Ok((ProviderName::from_str(raw)?, input.id.clone()));
    }
    for provider in ProviderName::ALL {
        if let Some(source_id) = input.id.strip_prefix(&format!("{provider}_")) {
            return Ok((provider, source_id.to_string()));
        }
    }
    Err(Error::Validation {
        field: "id".to_string(),
        reason: format!(
            "'{}' is not a canonical <provider>_<sourceId> id and no provider was given",
            input.id
        ),
    })
}

/// Map a domain error onto the tool error envelope.
fn domain_error(error: &Error) -> ToolResponse {
    let code = match error.class() {
        ErrorClass::Validation => INVALID_PARAMS,
        _ => INTERNAL_ERROR,
    };
    if code == INTERNAL_ERROR {
        warn!(%error, "tool call failed");
    }
    ToolResponse::error(
        code,
        error.to_string(),
        Some(serde_json::json!({
            "class": error.class(),
            "retryable": error.is_retryable(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_resolve_without_an_explicit_provider() {
        let input = GetPaperInput {
            id: "arxiv_1706.03762".to_string(),
            provider: None,
        };
        let (provider, source_id) = resolve_paper_id(&input).unwrap();
        assert_eq!(provider, ProviderName::Arxiv);
        assert_eq!(source_id, "1706.03762");

        let input = GetPaperInput {
            id: "semantic_scholar_abc".to_string(),
            provider: None,
        };
        let (provider, source_id) = resolve_paper_id(&input).unwrap();
        assert_eq!(provider, ProviderName::SemanticScholar);
        assert_eq!(source_id, "abc");
    }

    #[test]
    fn explicit_provider_wins() {
        let input = GetPaperInput {
            id: "1706.03762".to_string(),
            provider: Some("arxiv".to_string()),
        };
        let (provider, source_id) = resolve_paper_id(&input).unwrap();
        assert_eq!(provider, ProviderName::Arxiv);
        assert_eq!(source_id, "1706.03762");
    }

    #[test]
    fn unknown_provider_and_bare_id_are_rejected() {
        let input = GetPaperInput {
            id: "1706.03762".to_string(),
            provider: None,
        };
        assert!(resolve_paper_id(&input).is_err());

        let input = GetPaperInput {
            id: "x".to_string(),
            provider: Some("bogus".to_string()),
        };
        assert!(resolve_paper_id(&input).is_err());
    }

    #[test]
    fn domain_errors_carry_their_class() {
        let response = domain_error(&Error::NotFound {
            resource: "paper".to_string(),
            id: "arxiv_1".to_string(),
        });
        let error = response.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.data.unwrap()["class"], "not_found");

        let response = domain_error(&Error::Validation {
            field: "limit".to_string(),
            reason: "too big".to_string(),
        });
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }
}
