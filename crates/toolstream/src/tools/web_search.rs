use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::http::{send_with_retry, tool_error, RetryPolicy};
use super::{Source, ToolDefinition, ToolHandler};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;

pub const SEARCH_API_BASE_URL: &str = "https://api.tavily.com";
pub const DEFAULT_MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
}

/// Web search through the Tavily search API. Every result is also cited to the
/// client as a `source-url`.
pub struct WebSearchTool {
    client: Client,
    base_url: String,
    api_key: String,
    max_results: usize,
    policy: RetryPolicy,
}

impl WebSearchTool {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            client: Client::new(),
            base_url: SEARCH_API_BASE_URL.to_string(),
            api_key: api_key.into(),
            max_results: DEFAULT_MAX_RESULTS,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn into_definition(self) -> ToolDefinition {
        ToolDefinition::server(
            Tool::new(
                "webSearch",
                "Search the web for up-to-date information",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The search query"
                        }
                    },
                    "required": ["query"]
                }),
            ),
            self,
        )
    }

    pub async fn search(&self, query: &str) -> AgentResult<SearchResults> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({"query": query, "max_results": self.max_results}));

        let response = send_with_retry(request, self.policy)
            .await
            .map_err(|e| tool_error("Search service", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ExecutionError(format!(
                "Search service returned {}: {}",
                status, body
            )));
        }

        response
            .json::<SearchResults>()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Unexpected search payload: {}", e)))
    }
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidParameters("Missing string argument 'query'".into()))?;

        let results = self.search(query).await.map_err(|e| {
            tracing::warn!(query, "web search failed: {}", e);
            e
        })?;
        tracing::info!(query, results = results.results.len(), "web search");
        serde_json::to_value(results).map_err(|e| AgentError::Internal(e.to_string()))
    }

    fn sources(&self, output: &Value) -> Vec<Source> {
        let Ok(results) = serde_json::from_value::<SearchResults>(output.clone()) else {
            return Vec::new();
        };
        results
            .results
            .into_iter()
            .map(|result| Source {
                id: format!("src_{}", nanoid::nanoid!(10)),
                url: result.url,
                title: Some(result.title).filter(|title| !title.is_empty()),
            })
            .collect()
    }
}
