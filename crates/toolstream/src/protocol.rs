//! UI message stream protocol: the chunk vocabulary exchanged between the chat
//! endpoints and the browser, and the encoder turning agent events into chunks.
//!
//! On the wire each chunk is one server-sent event whose `data:` is the chunk's
//! JSON; the stream ends with a literal `[DONE]`.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentEvent, AgentStream};
use crate::providers::errors::ProviderError;

pub const DONE: &str = "[DONE]";
pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_STREAM_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiChunk {
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    StartStep,
    #[serde(rename_all = "camelCase")]
    TextStart { id: String },
    #[serde(rename_all = "camelCase")]
    TextDelta { id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    TextEnd { id: String },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable { tool_call_id: String, output: Value },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    #[serde(rename_all = "camelCase")]
    SourceUrl {
        source_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    FinishStep,
    Finish,
}

impl UiChunk {
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Format one SSE frame
pub fn sse_frame(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Stateful encoder for one assistant message. Text deltas are grouped into
/// text blocks; a block is closed before any tool or step boundary chunk.
pub struct UiStreamEncoder {
    message_id: String,
    open_text: Option<String>,
    text_counter: usize,
}

impl Default for UiStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UiStreamEncoder {
    pub fn new() -> Self {
        Self {
            message_id: format!("msg_{}", nanoid::nanoid!()),
            open_text: None,
            text_counter: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn start(&self) -> UiChunk {
        UiChunk::Start {
            message_id: Some(self.message_id.clone()),
        }
    }

    fn close_text(&mut self, chunks: &mut Vec<UiChunk>) {
        if let Some(id) = self.open_text.take() {
            chunks.push(UiChunk::TextEnd { id });
        }
    }

    pub fn encode(&mut self, event: AgentEvent) -> Vec<UiChunk> {
        let mut chunks = Vec::new();
        match event {
            AgentEvent::TextDelta(delta) => {
                let id = match &self.open_text {
                    Some(id) => id.clone(),
                    None => {
                        self.text_counter += 1;
                        let id = format!("text_{}", self.text_counter);
                        chunks.push(UiChunk::TextStart { id: id.clone() });
                        self.open_text = Some(id.clone());
                        id
                    }
                };
                chunks.push(UiChunk::TextDelta { id, delta });
            }
            AgentEvent::StartStep => {
                self.close_text(&mut chunks);
                chunks.push(UiChunk::StartStep);
            }
            AgentEvent::ToolInputStart { id, name } => {
                self.close_text(&mut chunks);
                chunks.push(UiChunk::ToolInputStart {
                    tool_call_id: id,
                    tool_name: name,
                });
            }
            AgentEvent::ToolInputDelta { id, delta } => {
                chunks.push(UiChunk::ToolInputDelta {
                    tool_call_id: id,
                    input_text_delta: delta,
                });
            }
            AgentEvent::ToolInputAvailable { id, name, input } => {
                self.close_text(&mut chunks);
                chunks.push(UiChunk::ToolInputAvailable {
                    tool_call_id: id,
                    tool_name: name,
                    input,
                });
            }
            AgentEvent::ToolOutputAvailable { id, output } => {
                chunks.push(UiChunk::ToolOutputAvailable {
                    tool_call_id: id,
                    output,
                });
            }
            AgentEvent::ToolOutputError { id, error_text } => {
                chunks.push(UiChunk::ToolOutputError {
                    tool_call_id: id,
                    error_text,
                });
            }
            AgentEvent::Source { id, url, title } => {
                chunks.push(UiChunk::SourceUrl {
                    source_id: id,
                    url,
                    title,
                });
            }
            AgentEvent::FinishStep { .. } => {
                self.close_text(&mut chunks);
                chunks.push(UiChunk::FinishStep);
            }
        }
        chunks
    }

    pub fn error(&mut self, error_text: String) -> Vec<UiChunk> {
        let mut chunks = Vec::new();
        self.close_text(&mut chunks);
        chunks.push(UiChunk::Error { error_text });
        chunks
    }

    pub fn finish(&mut self) -> Vec<UiChunk> {
        let mut chunks = Vec::new();
        self.close_text(&mut chunks);
        chunks.push(UiChunk::Finish);
        chunks
    }
}

/// Wrap an agent reply into the complete chunk sequence for one response:
/// `start`, the encoded events, an `error` chunk if the reply failed, and `finish`.
pub fn encode_agent_stream<F>(events: AgentStream, describe_error: F) -> BoxStream<'static, UiChunk>
where
    F: Fn(&ProviderError) -> String + Send + 'static,
{
    let mut encoder = UiStreamEncoder::new();
    Box::pin(async_stream::stream! {
        yield encoder.start();

        let mut events = events;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    for chunk in encoder.encode(event) {
                        yield chunk;
                    }
                }
                Err(e) => {
                    tracing::error!(kind = %e.kind, "reply failed: {}", e);
                    for chunk in encoder.error(describe_error(&e)) {
                        yield chunk;
                    }
                    break;
                }
            }
        }

        for chunk in encoder.finish() {
            yield chunk;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{FinishReason, Usage};
    use futures::stream;
    use serde_json::json;

    #[test]
    fn test_chunk_wire_format() {
        let chunk = UiChunk::ToolInputAvailable {
            tool_call_id: "call_1".into(),
            tool_name: "getWeather".into(),
            input: json!({"city": "Lahore"}),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({
                "type": "tool-input-available",
                "toolCallId": "call_1",
                "toolName": "getWeather",
                "input": {"city": "Lahore"}
            })
        );
        assert_eq!(
            serde_json::to_value(UiChunk::FinishStep).unwrap(),
            json!({"type": "finish-step"})
        );
        assert_eq!(
            serde_json::to_value(UiChunk::SourceUrl {
                source_id: "src_1".into(),
                url: "https://example.com".into(),
                title: None,
            })
            .unwrap(),
            json!({"type": "source-url", "sourceId": "src_1", "url": "https://example.com"})
        );
        let parsed: UiChunk =
            serde_json::from_str(r#"{"type":"tool-output-error","toolCallId":"c","errorText":"boom"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            UiChunk::ToolOutputError {
                tool_call_id: "c".into(),
                error_text: "boom".into()
            }
        );
    }

    #[test]
    fn test_text_blocks_close_before_tools() {
        let mut encoder = UiStreamEncoder::new();
        let mut chunks = Vec::new();
        for event in [
            AgentEvent::StartStep,
            AgentEvent::TextDelta("Let me ".into()),
            AgentEvent::TextDelta("check".into()),
            AgentEvent::ToolInputStart {
                id: "call_1".into(),
                name: "getWeather".into(),
            },
            AgentEvent::FinishStep {
                reason: FinishReason::ToolCalls,
                usage: Usage::default(),
            },
        ] {
            chunks.extend(encoder.encode(event));
        }

        assert_eq!(
            chunks,
            vec![
                UiChunk::StartStep,
                UiChunk::TextStart { id: "text_1".into() },
                UiChunk::TextDelta {
                    id: "text_1".into(),
                    delta: "Let me ".into()
                },
                UiChunk::TextDelta {
                    id: "text_1".into(),
                    delta: "check".into()
                },
                UiChunk::TextEnd { id: "text_1".into() },
                UiChunk::ToolInputStart {
                    tool_call_id: "call_1".into(),
                    tool_name: "getWeather".into()
                },
                UiChunk::FinishStep,
            ]
        );
    }

    #[tokio::test]
    async fn test_error_is_reported_then_finished() {
        let events: AgentStream = Box::pin(stream::iter(vec![
            Ok(AgentEvent::StartStep),
            Ok(AgentEvent::TextDelta("partial".into())),
            Err(ProviderError::from_message("request timed out")),
        ]));
        let chunks: Vec<UiChunk> = encode_agent_stream(events, |e| e.kind.to_string())
            .collect()
            .await;

        assert!(matches!(chunks[0], UiChunk::Start { .. }));
        let tail = &chunks[chunks.len() - 3..];
        assert_eq!(
            tail,
            &[
                UiChunk::TextEnd { id: "text_1".into() },
                UiChunk::Error {
                    error_text: "timeout".into()
                },
                UiChunk::Finish,
            ]
        );
    }

    #[test]
    fn test_sse_frame() {
        assert_eq!(sse_frame(DONE), "data: [DONE]\n\n");
    }
}
