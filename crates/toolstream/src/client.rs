//! Chat client for the `/api/*chat*` endpoints.
//!
//! Mirrors what the browser does: post the whole history, fold the UI message
//! stream into local state, run client-side tools, and resubmit once every tool
//! call of the last step has an outcome.

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{UiChunk, DONE};
use crate::sse::parse_sse_stream;
use crate::structured::PartialObjectStream;
use crate::tools::ToolHandler;
use crate::ui::{ChatRequest, ChatState, ToolState, UiMessage};

pub const DEFAULT_MAX_RESUBMISSIONS: usize = 5;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Unknown tool call: {0}")]
    UnknownToolCall(String),

    #[error("Duplicate tool call: {0}")]
    DuplicateToolCall(String),

    #[error("Unknown text block: {0}")]
    UnknownTextBlock(String),

    #[error("Tool call {tool_call_id} cannot move from {from} to {to}")]
    InvalidTransition {
        tool_call_id: String,
        from: ToolState,
        to: ToolState,
    },

    #[error("Stream chunk arrived before any assistant message")]
    NoAssistantMessage,

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed stream: {0}")]
    Stream(String),

    #[error("Server responded with {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Reply failed: {0}")]
    Reply(String),

    #[error("Stopped after {0} automatic resubmissions")]
    StepLimit(usize),
}

pub struct ChatSession {
    client: Client,
    endpoint: String,
    state: ChatState,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    max_resubmissions: usize,
}

impl ChatSession {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            state: ChatState::default(),
            handlers: HashMap::new(),
            max_resubmissions: DEFAULT_MAX_RESUBMISSIONS,
        }
    }

    /// Register a handler for a tool the server leaves to the client
    pub fn with_tool<S: Into<String>>(mut self, name: S, handler: impl ToolHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn with_max_resubmissions(mut self, max: usize) -> Self {
        self.max_resubmissions = max;
        self
    }

    pub fn with_history(mut self, messages: Vec<UiMessage>) -> Self {
        self.state = ChatState::new(messages);
        self
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn messages(&self) -> &[UiMessage] {
        &self.state.messages
    }

    /// Send a user message and keep the conversation going until the assistant
    /// stops calling tools, a tool is left without a local handler, or the
    /// resubmission cap is hit.
    pub async fn send<S: Into<String>>(&mut self, text: S) -> Result<(), ClientError> {
        self.state.push_user(UiMessage::user_text(text));

        let mut resubmissions = 0;
        loop {
            self.submit().await?;
            self.run_client_tools().await?;

            if !self.state.should_resubmit() {
                return Ok(());
            }
            if resubmissions >= self.max_resubmissions {
                return Err(ClientError::StepLimit(resubmissions));
            }
            resubmissions += 1;
            debug!(resubmissions, "resubmitting with client tool results");
        }
    }

    async fn submit(&mut self) -> Result<(), ClientError> {
        let request = ChatRequest {
            id: None,
            messages: self.state.messages.clone(),
        };
        let response =
            check_status(self.client.post(&self.endpoint).json(&request).send().await?).await?;

        let mut events = parse_sse_stream(response.bytes_stream());
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| ClientError::Stream(e.to_string()))?;
            if event.data == DONE {
                break;
            }
            let chunk: UiChunk = serde_json::from_str(&event.data)
                .map_err(|e| ClientError::Stream(format!("{}: {}", e, event.data)))?;
            self.state.apply(chunk)?;
        }

        match &self.state.error {
            Some(error) => Err(ClientError::Reply(error.clone())),
            None => Ok(()),
        }
    }

    async fn run_client_tools(&mut self) -> Result<(), ClientError> {
        for call in self.state.pending_client_tool_calls() {
            let Some(handler) = self.handlers.get(&call.tool_name).cloned() else {
                warn!(tool = %call.tool_name, "no client handler registered");
                continue;
            };
            let input = call.input.clone().unwrap_or(Value::Null);
            let result = handler.call(input).await;
            self.state.add_tool_result(&call.tool_call_id, result)?;
        }
        Ok(())
    }
}

/// Turn a non-success response into `ClientError::Server` carrying its `error` text
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body["error"]
        .as_str()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error"))
        .to_string();
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}

/// Post `body` to an object endpoint and yield the object each time it grows.
/// Every value extends the one before it; the stream fails if the body is cut
/// short or the text never becomes a complete JSON document.
pub fn stream_object(
    client: Client,
    url: String,
    body: Value,
) -> BoxStream<'static, Result<Value, ClientError>> {
    Box::pin(async_stream::try_stream! {
        let response = check_status(client.post(&url).json(&body).send().await?).await?;

        let mut partial = PartialObjectStream::new();
        let mut bytes = response.bytes_stream();
        // bytes of a character split across network chunks
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            pending.extend_from_slice(&chunk?);
            let valid = match std::str::from_utf8(&pending) {
                Ok(text) => text.len(),
                Err(e) => e.valid_up_to(),
            };
            let text = String::from_utf8(pending.drain(..valid).collect()).unwrap_or_default();
            if let Some(value) = partial.push(&text) {
                yield value;
            }
        }
        partial
            .finish()
            .map_err(|e| ClientError::Stream(e.to_string()))?;
    })
}
