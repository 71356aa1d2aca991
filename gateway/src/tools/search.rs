//! Knowledge base tools backed by Azure AI Search.
//!
//! `search` returns matching passages to the model as text. `report_grounding`
//! looks up the passages the model cited and hands them to the client.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use zeroize::Zeroizing;

use crate::config::SearchConfig;
use crate::core::events::{EventKind, EventSink, RelayEvent};
use crate::core::relay::{TokenProvider, ToolContext, ToolRegistry, ToolResult};

/// Search REST API version.
pub const SEARCH_API_VERSION: &str = "2024-07-01";

/// Scope requested for Azure AI Search tokens.
pub const SEARCH_SCOPE: &str = "https://search.azure.com/.default";

/// Hits returned by `search`.
const SEARCH_TOP: usize = 5;

/// Candidates considered by the vector query.
const VECTOR_K_NEAREST: usize = 50;

pub const NO_RESULTS_MESSAGE: &str = "No documents found in the knowledge base for this query.";

/// Field read from grounding documents when the index has it.
const SOURCE_FILE_FIELD: &str = "source_file";

static SOURCE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_=\-]+$").unwrap());

/// How requests to the search service are authenticated.
#[derive(Clone)]
pub enum SearchAuth {
    ApiKey(Zeroizing<String>),
    Bearer(Arc<dyn TokenProvider>),
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

/// Client for one search index.
pub struct SearchClient {
    http: reqwest::Client,
    url: String,
    auth: SearchAuth,
    semantic_configuration: Option<String>,
    identifier_field: String,
    content_field: String,
    embedding_field: String,
    title_field: String,
    use_vector_query: bool,
    events: Arc<dyn EventSink>,
}

impl SearchClient {
    pub fn new(config: &SearchConfig, auth: SearchAuth, events: Arc<dyn EventSink>) -> Self {
        let url = format!(
            "{}/indexes/{}/docs/search?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.index,
            SEARCH_API_VERSION
        );
        Self {
            http: reqwest::Client::new(),
            url,
            auth,
            semantic_configuration: config.semantic_configuration.clone(),
            identifier_field: config.identifier_field.clone(),
            content_field: config.content_field.clone(),
            embedding_field: config.embedding_field.clone(),
            title_field: config.title_field.clone(),
            use_vector_query: config.use_vector_query,
            events,
        }
    }

    async fn query(&self, body: Value) -> anyhow::Result<Vec<Map<String, Value>>> {
        let mut request = self.http.post(&self.url).json(&body);
        request = match &self.auth {
            SearchAuth::ApiKey(key) => request.header("api-key", key.as_str()),
            SearchAuth::Bearer(provider) => {
                let token = Zeroizing::new(provider.token().await?);
                request.bearer_auth(token.as_str())
            }
        };

        let response = request.send().await.context("search request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("search service returned {status}: {detail}"));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("invalid search response")?;
        Ok(parsed.value)
    }

    /// Hybrid query; one `[id]: content` block per hit.
    pub async fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
    ) -> anyhow::Result<ToolResult> {
        tracing::info!(query = %query, session_id = ?session_id, "Searching knowledge base");

        let query_type = if self.semantic_configuration.is_some() {
            "semantic"
        } else {
            "simple"
        };
        let mut body = json!({
            "search": query,
            "queryType": query_type,
            "top": SEARCH_TOP,
            "select": format!("{},{}", self.identifier_field, self.content_field),
        });
        if let Some(semantic) = &self.semantic_configuration {
            body["semanticConfiguration"] = json!(semantic);
        }
        if self.use_vector_query {
            body["vectorQueries"] = json!([{
                "kind": "text",
                "text": query,
                "fields": &self.embedding_field,
                "k": VECTOR_K_NEAREST,
            }]);
        }

        let hits = self.query(body).await?;

        let mut text = String::new();
        let mut ids = Vec::with_capacity(hits.len());
        for hit in &hits {
            let id = field_text(hit, &self.identifier_field);
            let content = field_text(hit, &self.content_field);
            text.push_str(&format!("[{id}]: {content}\n-----\n"));
            ids.push(id);
        }

        self.emit(
            RelayEvent::new(
                EventKind::SearchQuery,
                format!("Search returned {} result(s)", hits.len()),
            )
            .with_data(json!({
                "query": query,
                "query_type": query_type,
                "use_vector_query": self.use_vector_query,
                "result_count": hits.len(),
                "result_ids": ids,
            })),
            session_id,
        );

        if hits.is_empty() {
            return Ok(ToolResult::to_server(NO_RESULTS_MESSAGE));
        }
        Ok(ToolResult::to_server(text))
    }

    /// Fetch the cited passages for the client.
    pub async fn report_grounding(
        &self,
        sources: &[String],
        session_id: Option<&str>,
    ) -> anyhow::Result<ToolResult> {
        let ids: Vec<&str> = sources
            .iter()
            .map(String::as_str)
            .filter(|s| SOURCE_ID_PATTERN.is_match(s))
            .collect();
        if ids.len() < sources.len() {
            tracing::warn!(
                dropped = sources.len() - ids.len(),
                "Ignoring malformed grounding source ids"
            );
        }

        let docs: Vec<Value> = if ids.is_empty() {
            Vec::new()
        } else {
            let filter = ids
                .iter()
                .map(|id| format!("{} eq '{id}'", self.identifier_field))
                .collect::<Vec<_>>()
                .join(" or ");
            let select = [
                self.identifier_field.as_str(),
                self.title_field.as_str(),
                self.content_field.as_str(),
                SOURCE_FILE_FIELD,
            ]
            .join(",");
            let body = json!({
                "search": "*",
                "filter": filter,
                "select": select,
                "top": ids.len(),
            });
            self.query(body)
                .await?
                .iter()
                .map(|hit| self.grounding_doc(hit))
                .collect()
        };

        self.emit(
            RelayEvent::new(
                EventKind::GroundingSources,
                format!("Retrieved {} grounding source(s)", docs.len()),
            )
            .with_data(json!({
                "source_ids": ids,
                "retrieved": docs
                    .iter()
                    .map(|d| json!({
                        "chunk_id": d["chunk_id"],
                        "title": d["title"],
                        "source_file": d["source_file"],
                    }))
                    .collect::<Vec<_>>(),
            })),
            session_id,
        );

        Ok(ToolResult::to_client(json!({ "sources": docs })))
    }

    fn emit(&self, event: RelayEvent, session_id: Option<&str>) {
        match session_id {
            Some(id) => self.events.emit(event.with_session(id)),
            None => self.events.emit(event),
        }
    }

    fn grounding_doc(&self, hit: &Map<String, Value>) -> Value {
        let title = field_text(hit, &self.title_field);
        let source_file = match hit.get(SOURCE_FILE_FIELD) {
            Some(Value::String(file)) => file.clone(),
            _ => title.clone(),
        };
        json!({
            "chunk_id": field_text(hit, &self.identifier_field),
            "title": title,
            "chunk": field_text(hit, &self.content_field),
            "source_file": source_file,
        })
    }
}

fn field_text(hit: &Map<String, Value>, field: &str) -> String {
    match hit.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn search_tool_schema() -> Value {
    json!({
        "type": "function",
        "name": "search",
        "description": "Search the knowledge base. The knowledge base is in English, translate to and from English if \
                        needed. Results are formatted as a source name first in square brackets, followed by the text \
                        content, and a line with '-----' at the end of each result.",
        "parameters": {
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }
    })
}

pub fn grounding_tool_schema() -> Value {
    json!({
        "type": "function",
        "name": "report_grounding",
        "description": "Report use of a source from the knowledge base as part of an answer (effectively, cite the source). \
                        Sources appear in square brackets before each knowledge base passage. Always use this tool to cite \
                        sources when responding with information from the knowledge base.",
        "parameters": {
            "type": "object",
            "properties": {
                "sources": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of source names from last statement actually used, do not include the ones not used to formulate a response"
                }
            },
            "required": ["sources"],
            "additionalProperties": false
        }
    })
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[derive(Deserialize)]
struct GroundingArgs {
    sources: Vec<String>,
}

/// Register `search` and `report_grounding` against one client.
pub fn register_search_tools(registry: &mut ToolRegistry, client: Arc<SearchClient>) {
    let search_client = client.clone();
    registry.register_with_context(
        "search",
        search_tool_schema(),
        move |args: Value, context: ToolContext| {
            let client = search_client.clone();
            async move {
                let args: SearchArgs = serde_json::from_value(args)
                    .context("search expects {\"query\": string}")?;
                client.search(&args.query, Some(&context.session_id)).await
            }
        },
    );

    registry.register_with_context(
        "report_grounding",
        grounding_tool_schema(),
        move |args: Value, context: ToolContext| {
            let client = client.clone();
            async move {
                let args: GroundingArgs = serde_json::from_value(args)
                    .context("report_grounding expects {\"sources\": [string]}")?;
                client
                    .report_grounding(&args.sources, Some(&context.session_id))
                    .await
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventLog, EventQuery};
    use crate::core::relay::{StaticTokenProvider, ToolResultDirection};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX_PATH: &str = "/indexes/kb/docs/search";

    fn config(endpoint: &str) -> SearchConfig {
        SearchConfig::new(endpoint, "kb")
    }

    fn client(config: SearchConfig) -> (SearchClient, Arc<EventLog>) {
        let log = Arc::new(EventLog::default());
        let client = SearchClient::new(
            &config,
            SearchAuth::ApiKey(Zeroizing::new("search-key".to_string())),
            log.clone(),
        );
        (client, log)
    }

    #[tokio::test]
    async fn test_search_formats_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INDEX_PATH))
            .and(query_param("api-version", SEARCH_API_VERSION))
            .and(header("api-key", "search-key"))
            .and(body_partial_json(json!({
                "search": "refill",
                "queryType": "simple",
                "top": 5,
                "select": "chunk_id,chunk",
                "vectorQueries": [{"kind": "text", "fields": "text_vector", "k": 50}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"chunk_id": "doc1", "chunk": "text"},
                    {"chunk_id": "doc2", "chunk": "more"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (client, log) = client(config(&server.uri()));
        let result = client.search("refill", None).await.unwrap();

        assert_eq!(result.direction, ToolResultDirection::ToServer);
        assert_eq!(result.to_text(), "[doc1]: text\n-----\n[doc2]: more\n-----\n");

        let events = log.query(&EventQuery {
            kinds: Some(vec![EventKind::SearchQuery]),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["result_count"], 2);
    }

    #[tokio::test]
    async fn test_search_semantic_without_vectors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INDEX_PATH))
            .and(body_partial_json(json!({
                "queryType": "semantic",
                "semanticConfiguration": "default"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.semantic_configuration = Some("default".to_string());
        cfg.use_vector_query = false;
        let (client, _) = client(cfg);

        let result = client.search("anything", None).await.unwrap();
        assert_eq!(result.to_text(), NO_RESULTS_MESSAGE);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("vectorQueries").is_none());
    }

    #[tokio::test]
    async fn test_search_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let (client, _) = client(config(&server.uri()));
        let err = client.search("q", None).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_report_grounding_filters_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INDEX_PATH))
            .and(body_partial_json(json!({
                "search": "*",
                "filter": "chunk_id eq 'doc_1' or chunk_id eq 'doc=2'",
                "select": "chunk_id,title,chunk,source_file",
                "top": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"chunk_id": "doc_1", "title": "Guide", "chunk": "a", "source_file": "guide.pdf"},
                    {"chunk_id": "doc=2", "title": "FAQ", "chunk": "b"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (client, log) = client(config(&server.uri()));
        let sources = vec![
            "doc_1".to_string(),
            "doc=2".to_string(),
            "x' or 1 eq 1".to_string(),
        ];
        let result = client.report_grounding(&sources, None).await.unwrap();

        assert_eq!(result.direction, ToolResultDirection::ToClient);
        let docs: Value = serde_json::from_str(&result.to_text()).unwrap();
        assert_eq!(docs["sources"][0]["source_file"], "guide.pdf");
        // falls back to the title
        assert_eq!(docs["sources"][1]["source_file"], "FAQ");
        assert_eq!(docs["sources"][1]["chunk"], "b");

        let events = log.query(&EventQuery {
            kinds: Some(vec![EventKind::GroundingSources]),
            ..Default::default()
        });
        assert_eq!(events[0].data["source_ids"], json!(["doc_1", "doc=2"]));
    }

    #[tokio::test]
    async fn test_report_grounding_without_valid_ids_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (client, _) = client(config(&server.uri()));
        let result = client
            .report_grounding(&["bad id".to_string()], None)
            .await
            .unwrap();
        assert_eq!(result.to_text(), r#"{"sources":[]}"#);
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer search-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = SearchClient::new(
            &config(&server.uri()),
            SearchAuth::Bearer(Arc::new(StaticTokenProvider::new("search-token"))),
            Arc::new(EventLog::default()),
        );
        client.search("q", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_registered_tools_parse_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"chunk_id": "doc1", "chunk": "text"}]
            })))
            .mount(&server)
            .await;

        let (client, _) = client(config(&server.uri()));
        let mut registry = ToolRegistry::new();
        register_search_tools(&mut registry, Arc::new(client));
        assert_eq!(registry.names(), vec!["report_grounding", "search"]);

        let search = registry.get("search").unwrap();
        let context = ToolContext::new("sess-9", "call-1");
        let result = search
            .invoke(json!({"query": "refill"}), context.clone())
            .await
            .unwrap();
        assert_eq!(result.to_text(), "[doc1]: text\n-----\n");

        assert!(search.invoke(json!({"q": "missing"}), context).await.is_err());
    }

    #[tokio::test]
    async fn test_tool_events_carry_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"chunk_id": "doc1", "title": "Guide", "chunk": "text"}]
            })))
            .mount(&server)
            .await;

        let (client, log) = client(config(&server.uri()));
        let mut registry = ToolRegistry::new();
        register_search_tools(&mut registry, Arc::new(client));

        let context = ToolContext::new("sess-9", "call-1");
        registry
            .get("search")
            .unwrap()
            .invoke(json!({"query": "refill"}), context.clone())
            .await
            .unwrap();
        registry
            .get("report_grounding")
            .unwrap()
            .invoke(json!({"sources": ["doc1"]}), context)
            .await
            .unwrap();

        let query = EventQuery {
            session_id: Some("sess-9".to_string()),
            ..Default::default()
        };
        let kinds: Vec<EventKind> = log.query(&query).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SearchQuery, EventKind::GroundingSources]);
    }
}
