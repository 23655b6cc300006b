use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// Constrains the model to produce JSON matching `schema`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

impl ResponseFormat {
    pub fn new<S: Into<String>>(name: S, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Everything the provider needs for one model call
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub response_format: Option<ResponseFormat>,
}

impl CompletionRequest {
    pub fn new<S: Into<String>>(system: S, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

impl FinishReason {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            _ => FinishReason::Other,
        }
    }
}

/// Incremental output of a streamed model call. Tool call arguments arrive as raw JSON
/// text fragments keyed by the call's position in the response.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        arguments: String,
    },
    Finish {
        reason: FinishReason,
        usage: Usage,
    },
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

/// Audio handed to a transcription model
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub data: Bytes,
    pub media_type: String,
    pub filename: String,
}

/// Base trait for AI providers (OpenAI and compatible hosts)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message in one shot
    async fn complete(&self, request: &CompletionRequest)
        -> Result<(Message, Usage), ProviderError>;

    /// Generate the next message as a stream of deltas. The default replays a
    /// non-streamed completion as events.
    async fn stream(&self, request: &CompletionRequest) -> Result<ProviderStream, ProviderError> {
        let (message, usage) = self.complete(request).await?;
        let events = message_to_events(&message, usage);
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    /// Generate an image and return it base64 encoded
    async fn generate_image(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::unsupported("Image generation"))
    }

    /// Synthesize speech, returning encoded mp3 bytes
    async fn speech(&self, _text: &str) -> Result<Bytes, ProviderError> {
        Err(ProviderError::unsupported("Speech synthesis"))
    }

    /// Transcribe audio into text, steered by `prompt`
    async fn transcribe(&self, _audio: AudioInput, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::unsupported("Transcription"))
    }
}

/// Replay a complete message as the event sequence a streaming provider would have produced
pub fn message_to_events(message: &Message, usage: Usage) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let mut index = 0;
    let mut has_tool_calls = false;

    for content in &message.content {
        match content {
            MessageContent::Text(text) if !text.text.is_empty() => {
                events.push(ProviderEvent::TextDelta(text.text.clone()));
            }
            MessageContent::ToolRequest(request) => {
                has_tool_calls = true;
                let (name, arguments) = match &request.tool_call {
                    Ok(call) => (call.name.clone(), call.arguments.to_string()),
                    Err(_) => ("invalid name".to_string(), "{}".to_string()),
                };
                events.push(ProviderEvent::ToolCallStart {
                    index,
                    id: request.id.clone(),
                    name,
                });
                events.push(ProviderEvent::ToolCallDelta { index, arguments });
                index += 1;
            }
            _ => {}
        }
    }

    let reason = if has_tool_calls {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    };
    events.push(ProviderEvent::Finish { reason, usage });
    events
}
