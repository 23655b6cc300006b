//! Model Context Protocol client over the streamable HTTP transport, built on `rmcp`.
//!
//! One client lives for one chat request: it is connected before generation
//! starts, its tools are merged into the endpoint's registry, and it is closed
//! once when the reply ends. `close` is idempotent, and dropping an open client
//! schedules the close on the current runtime so an aborted request still
//! releases the remote session.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rmcp::{
    model::CallToolRequestParam,
    service::{Peer, RoleClient, RunningService, ServiceExt},
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig,
        StreamableHttpClientTransport,
    },
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::http::RetryPolicy;
use super::{ToolDefinition, ToolHandler};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP server timed out: {0}")]
    Timeout(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP client is closed")]
    Closed,
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<McpError> for AgentError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Timeout(_) => AgentError::Timeout(err.to_string()),
            _ => AgentError::ExecutionError(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub policy: RetryPolicy,
}

impl McpConfig {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The token is sent verbatim as the `Authorization` value
    fn transport(&self) -> Result<StreamableHttpClientTransport<reqwest::Client>, McpError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| McpError::Transport(format!("invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(self.url.clone()),
        ))
    }
}

/// Run `operation` under the policy's timeout, retrying only when an attempt
/// times out. Used for the idempotent requests (initialize, tools/list).
async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut operation: F) -> Result<T, McpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let mut attempt = 0;
    loop {
        match timeout(policy.timeout, operation()).await {
            Ok(result) => return result,
            Err(_) if attempt < policy.retries => {
                attempt += 1;
                warn!(attempt, "MCP {} timed out, retrying", what);
                sleep(policy.backoff).await;
            }
            Err(_) => {
                return Err(McpError::Timeout(format!(
                    "{} took longer than {:?}",
                    what, policy.timeout
                )))
            }
        }
    }
}

pub struct McpClient {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    policy: RetryPolicy,
    closed: AtomicBool,
}

impl McpClient {
    /// Open a session: `initialize` followed by `notifications/initialized`
    pub async fn connect(config: McpConfig) -> Result<Self, McpError> {
        let settings = &config;
        let service = with_retry(config.policy, "initialize", || async move {
            let transport = settings.transport()?;
            ().serve(transport)
                .await
                .map_err(|e| McpError::Transport(e.to_string()))
        })
        .await?;
        info!(url = %config.url, "connected to MCP server");
        debug!("MCP server info: {:?}", service.peer_info());

        Ok(Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            policy: config.policy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        Ok(())
    }

    fn take_service(&self) -> Option<RunningService<RoleClient, ()>> {
        self.service.lock().ok().and_then(|mut service| service.take())
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_open()?;
        let peer = &self.peer;
        let tools = with_retry(self.policy, "tools/list", || async move {
            peer.list_all_tools()
                .await
                .map_err(|e| McpError::Transport(e.to_string()))
        })
        .await?;

        Ok(tools
            .into_iter()
            .map(|tool| {
                Tool::new(
                    tool.name.to_string(),
                    tool.description.as_deref().unwrap_or_default(),
                    Value::Object((*tool.input_schema).clone()),
                )
            })
            .collect())
    }

    /// Invoke a remote tool once; a call is never retried since it may have side
    /// effects. A result flagged `isError` is reported as a failure carrying the
    /// tool's own text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.ensure_open()?;
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(McpError::Protocol(format!(
                    "arguments for {} must be an object, got {}",
                    name, other
                )))
            }
        };

        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        };
        let result = timeout(self.policy.timeout, self.peer.call_tool(request))
            .await
            .map_err(|_| {
                McpError::Timeout(format!("{} took longer than {:?}", name, self.policy.timeout))
            })?
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let result = serde_json::to_value(&result).map_err(|e| McpError::Protocol(e.to_string()))?;
        if result["isError"].as_bool().unwrap_or(false) {
            let text = result["content"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            return Err(McpError::Protocol(format!("{} failed: {}", name, text)));
        }
        Ok(result)
    }

    /// Remote tools wrapped as registry entries that call back into this client
    pub async fn tool_definitions(self: &Arc<Self>) -> Result<Vec<ToolDefinition>, McpError> {
        let tools = self.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| {
                let handler = McpToolHandler {
                    client: Arc::clone(self),
                    name: tool.name.clone(),
                };
                ToolDefinition::server(tool, handler)
            })
            .collect())
    }

    /// Terminate the session. Only the first call talks to the server.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(service) = self.take_service() else {
            return Ok(());
        };
        let reason = service
            .cancel()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        info!("closed MCP session: {:?}", reason);
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(service) = self.take_service() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("MCP client dropped outside a runtime; session left open");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = service.cancel().await {
                warn!("failed to close MCP session on drop: {}", e);
            }
        });
    }
}

struct McpToolHandler {
    client: Arc<McpClient>,
    name: String,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        Ok(self.client.call_tool(&self.name, arguments).await?)
    }
}
