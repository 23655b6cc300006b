//! Browser-side message model.
//!
//! `UiMessage` is what the chat endpoints receive (the whole history, on every
//! request) and what the client keeps locally. Assistant messages are built up by
//! [`ChatState::apply`], which folds stream chunks into the last assistant message
//! and enforces the tool-call lifecycle.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use strum_macros::Display;

use crate::client::ClientError;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::{Content, FileContent};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::ToolCall;
use crate::protocol::UiChunk;
use crate::structured::parse_partial_json;
use crate::tools::ToolRegistry;

/// Lifecycle of one tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::OutputAvailable | ToolState::OutputError)
    }

    /// Legal edges: input keeps streaming, input completes, then exactly one outcome
    pub fn can_transition_to(&self, next: ToolState) -> bool {
        use ToolState::*;
        matches!(
            (self, next),
            (InputStreaming, InputStreaming)
                | (InputStreaming, InputAvailable)
                | (InputAvailable, OutputAvailable)
                | (InputAvailable, OutputError)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub state: ToolState,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_text: Option<String>,
    /// Tools not known to the client ahead of time (e.g. MCP) travel as `dynamic-tool`
    pub dynamic: bool,
    input_text: String,
}

impl ToolInvocation {
    pub fn new<I: Into<String>, N: Into<String>>(tool_call_id: I, tool_name: N) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolState::InputStreaming,
            input: None,
            output: None,
            error_text: None,
            dynamic: false,
            input_text: String::new(),
        }
    }

    fn transition(&mut self, next: ToolState) -> Result<(), ClientError> {
        if !self.state.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                tool_call_id: self.tool_call_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        if self.dynamic {
            map.insert("type".into(), json!("dynamic-tool"));
            map.insert("toolName".into(), json!(self.tool_name));
        } else {
            map.insert("type".into(), json!(format!("tool-{}", self.tool_name)));
        }
        map.insert("toolCallId".into(), json!(self.tool_call_id));
        map.insert("state".into(), json!(self.state));
        if let Some(input) = &self.input {
            map.insert("input".into(), input.clone());
        }
        if let Some(output) = &self.output {
            map.insert("output".into(), output.clone());
        }
        if let Some(error_text) = &self.error_text {
            map.insert("errorText".into(), json!(error_text));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiPart {
    Text {
        text: String,
    },
    File {
        media_type: String,
        url: String,
        filename: Option<String>,
    },
    Tool(ToolInvocation),
    StepStart,
    /// Part types this service does not interpret (reasoning, sources, data parts)
    Other(Value),
}

impl UiPart {
    pub fn text<S: Into<String>>(text: S) -> Self {
        UiPart::Text { text: text.into() }
    }

    pub fn as_tool(&self) -> Option<&ToolInvocation> {
        match self {
            UiPart::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            UiPart::Text { text } => json!({"type": "text", "text": text}),
            UiPart::File {
                media_type,
                url,
                filename,
            } => {
                let mut value = json!({"type": "file", "mediaType": media_type, "url": url});
                if let Some(filename) = filename {
                    value["filename"] = json!(filename);
                }
                value
            }
            UiPart::Tool(tool) => tool.to_value(),
            UiPart::StepStart => json!({"type": "step-start"}),
            UiPart::Other(value) => value.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTextPart {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFilePart {
    url: String,
    media_type: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolPart {
    tool_call_id: String,
    #[serde(default)]
    tool_name: Option<String>,
    state: ToolState,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error_text: Option<String>,
}

impl<'de> Deserialize<'de> for UiPart {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let type_str = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| de::Error::missing_field("type"))?
            .to_string();

        match type_str.as_str() {
            "text" => {
                let part: WireTextPart = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(UiPart::Text { text: part.text })
            }
            "file" => {
                let part: WireFilePart = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(UiPart::File {
                    media_type: part.media_type,
                    url: part.url,
                    filename: part.filename,
                })
            }
            "step-start" => Ok(UiPart::StepStart),
            other if other.starts_with("tool-") || other == "dynamic-tool" => {
                let dynamic = type_str == "dynamic-tool";
                let part: WireToolPart = serde_json::from_value(value).map_err(de::Error::custom)?;
                let tool_name = match part.tool_name {
                    Some(name) if !name.is_empty() => name,
                    _ if !dynamic => type_str.trim_start_matches("tool-").to_string(),
                    _ => return Err(de::Error::missing_field("toolName")),
                };
                let input_text = part
                    .input
                    .as_ref()
                    .map(|input| input.to_string())
                    .unwrap_or_default();
                Ok(UiPart::Tool(ToolInvocation {
                    tool_call_id: part.tool_call_id,
                    tool_name,
                    state: part.state,
                    input: part.input,
                    output: part.output,
                    error_text: part.error_text,
                    dynamic,
                    input_text,
                }))
            }
            _ => Ok(UiPart::Other(value)),
        }
    }
}

impl Serialize for UiPart {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<UiPart>,
}

impl UiMessage {
    pub fn new<S: Into<String>>(id: S, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
        }
    }

    pub fn user_text<S: Into<String>>(text: S) -> Self {
        Self {
            id: format!("msg_{}", nanoid::nanoid!()),
            role: Role::User,
            parts: vec![UiPart::text(text)],
        }
    }

    pub fn with_part(mut self, part: UiPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                UiPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(UiPart::as_tool)
    }

    fn tool_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts.iter_mut().find_map(|part| match part {
            UiPart::Tool(tool) if tool.tool_call_id == tool_call_id => Some(tool),
            _ => None,
        })
    }

    /// Parts after the last `step-start`
    pub fn last_step(&self) -> &[UiPart] {
        let start = self
            .parts
            .iter()
            .rposition(|part| *part == UiPart::StepStart)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.parts[start..]
    }
}

/// Body of every chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub messages: Vec<UiMessage>,
}

/// Convert browser history into model messages. Each assistant step becomes an
/// assistant message followed by the tool results of that step; calls that never
/// produced an output are left out so the model is not shown unanswered calls.
/// `registry` decides how tool outputs are presented to the model.
pub fn ui_messages_to_messages(messages: &[UiMessage], registry: &ToolRegistry) -> Vec<Message> {
    let mut converted = Vec::new();

    for message in messages {
        match message.role {
            Role::User | Role::System => {
                let mut out = match message.role {
                    Role::System => Message::system(),
                    _ => Message::user(),
                };
                for part in &message.parts {
                    match part {
                        UiPart::Text { text } => out = out.with_text(text),
                        UiPart::File {
                            media_type,
                            url,
                            filename,
                        } => {
                            if let Content::File(mut file) = Content::file_from_url(url, media_type) {
                                file.filename = filename.clone();
                                out = out.with_file(file);
                            }
                        }
                        _ => {}
                    }
                }
                if !out.is_empty() {
                    converted.push(out);
                }
            }
            Role::Assistant => {
                let mut steps: Vec<Vec<&UiPart>> = vec![Vec::new()];
                for part in &message.parts {
                    match part {
                        UiPart::StepStart => steps.push(Vec::new()),
                        _ => {
                            if let Some(step) = steps.last_mut() {
                                step.push(part);
                            }
                        }
                    }
                }
                for step in steps {
                    convert_assistant_step(&step, registry, &mut converted);
                }
            }
        }
    }

    converted
}

fn convert_assistant_step(parts: &[&UiPart], registry: &ToolRegistry, out: &mut Vec<Message>) {
    let mut assistant = Message::assistant();
    let mut results = Message::user();

    for part in parts {
        match part {
            UiPart::Text { text } if !text.is_empty() => assistant = assistant.with_text(text),
            UiPart::File {
                media_type, url, ..
            } => {
                if let Content::File(file) = Content::file_from_url(url, media_type) {
                    assistant = assistant.with_file(file);
                }
            }
            UiPart::Tool(tool) if tool.state.is_terminal() => {
                let input = tool.input.clone().unwrap_or_else(|| json!({}));
                assistant = assistant.with_tool_request(
                    &tool.tool_call_id,
                    Ok(ToolCall::new(&tool.tool_name, input)),
                );
                let result: AgentResult<Value> = match tool.state {
                    ToolState::OutputAvailable => {
                        let output = tool.output.clone().unwrap_or(Value::Null);
                        Ok(registry
                            .get(&tool.tool_name)
                            .map(|definition| definition.model_output(&output))
                            .unwrap_or(output))
                    }
                    _ => Err(AgentError::ExecutionError(
                        tool.error_text.clone().unwrap_or_default(),
                    )),
                };
                results = results.with_tool_response(&tool.tool_call_id, result);
            }
            _ => {}
        }
    }

    if !assistant.is_empty() {
        out.push(assistant);
    }
    if !results.is_empty() {
        out.push(results);
    }
}

/// Resubmission rule: the last assistant step called tools and every one of them
/// has an outcome.
pub fn last_assistant_message_is_complete_with_tool_calls(messages: &[UiMessage]) -> bool {
    let Some(last) = messages.last().filter(|m| m.role == Role::Assistant) else {
        return false;
    };
    let tools: Vec<&ToolInvocation> = last.last_step().iter().filter_map(UiPart::as_tool).collect();
    !tools.is_empty() && tools.iter().all(|tool| tool.state.is_terminal())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChatStatus {
    Ready,
    Streaming,
    Error,
}

/// Client-side conversation state: the history plus the stream currently being applied
#[derive(Debug, Clone)]
pub struct ChatState {
    pub messages: Vec<UiMessage>,
    pub status: ChatStatus,
    pub error: Option<String>,
    open_text: HashMap<String, usize>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ChatState {
    pub fn new(messages: Vec<UiMessage>) -> Self {
        Self {
            messages,
            status: ChatStatus::Ready,
            error: None,
            open_text: HashMap::new(),
        }
    }

    pub fn push_user(&mut self, message: UiMessage) {
        self.messages.push(message);
    }

    fn assistant_mut(&mut self) -> Result<&mut UiMessage, ClientError> {
        self.messages
            .last_mut()
            .filter(|m| m.role == Role::Assistant)
            .ok_or(ClientError::NoAssistantMessage)
    }

    fn tool_mut(&mut self, tool_call_id: &str) -> Result<&mut ToolInvocation, ClientError> {
        self.assistant_mut()?
            .tool_mut(tool_call_id)
            .ok_or_else(|| ClientError::UnknownToolCall(tool_call_id.to_string()))
    }

    /// Apply one chunk. Chunks must be applied in arrival order.
    pub fn apply(&mut self, chunk: UiChunk) -> Result<(), ClientError> {
        match chunk {
            UiChunk::Start { message_id } => {
                self.status = ChatStatus::Streaming;
                self.error = None;
                self.open_text.clear();
                // a resubmission continues the assistant message it answers
                let continuing = self
                    .messages
                    .last()
                    .is_some_and(|m| m.role == Role::Assistant);
                if !continuing {
                    let id = message_id.unwrap_or_else(|| format!("msg_{}", nanoid::nanoid!()));
                    self.messages.push(UiMessage::new(id, Role::Assistant));
                }
            }
            UiChunk::StartStep => {
                self.assistant_mut()?.parts.push(UiPart::StepStart);
            }
            UiChunk::TextStart { id } => {
                let message = self.assistant_mut()?;
                message.parts.push(UiPart::text(""));
                let index = message.parts.len() - 1;
                self.open_text.insert(id, index);
            }
            UiChunk::TextDelta { id, delta } => {
                let index = *self
                    .open_text
                    .get(&id)
                    .ok_or_else(|| ClientError::UnknownTextBlock(id.clone()))?;
                if let Some(UiPart::Text { text }) = self.assistant_mut()?.parts.get_mut(index) {
                    text.push_str(&delta);
                }
            }
            UiChunk::TextEnd { id } => {
                self.open_text
                    .remove(&id)
                    .ok_or(ClientError::UnknownTextBlock(id))?;
            }
            UiChunk::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                let message = self.assistant_mut()?;
                if message.tool_mut(&tool_call_id).is_some() {
                    return Err(ClientError::DuplicateToolCall(tool_call_id));
                }
                message
                    .parts
                    .push(UiPart::Tool(ToolInvocation::new(tool_call_id, tool_name)));
            }
            UiChunk::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => {
                let tool = self.tool_mut(&tool_call_id)?;
                tool.transition(ToolState::InputStreaming)?;
                tool.input_text.push_str(&input_text_delta);
                if let Some(partial) = parse_partial_json(&tool.input_text) {
                    tool.input = Some(partial);
                }
            }
            UiChunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                let message = self.assistant_mut()?;
                match message.tool_mut(&tool_call_id) {
                    Some(tool) => {
                        tool.transition(ToolState::InputAvailable)?;
                        tool.input = Some(input);
                    }
                    None => {
                        let mut tool = ToolInvocation::new(tool_call_id, tool_name);
                        tool.state = ToolState::InputAvailable;
                        tool.input = Some(input);
                        message.parts.push(UiPart::Tool(tool));
                    }
                }
            }
            UiChunk::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                let tool = self.tool_mut(&tool_call_id)?;
                tool.transition(ToolState::OutputAvailable)?;
                tool.output = Some(output);
            }
            UiChunk::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                let tool = self.tool_mut(&tool_call_id)?;
                tool.transition(ToolState::OutputError)?;
                tool.error_text = Some(error_text);
            }
            UiChunk::SourceUrl {
                source_id,
                url,
                title,
            } => {
                let mut part = json!({"type": "source-url", "sourceId": source_id, "url": url});
                if let Some(title) = title {
                    part["title"] = Value::String(title);
                }
                self.assistant_mut()?.parts.push(UiPart::Other(part));
            }
            UiChunk::Error { error_text } => {
                self.status = ChatStatus::Error;
                self.error = Some(error_text);
            }
            UiChunk::FinishStep => {
                self.open_text.clear();
            }
            UiChunk::Finish => {
                self.open_text.clear();
                if self.status != ChatStatus::Error {
                    self.status = ChatStatus::Ready;
                }
            }
        }
        Ok(())
    }

    /// Record the outcome of a client-side tool call
    pub fn add_tool_result(
        &mut self,
        tool_call_id: &str,
        result: AgentResult<Value>,
    ) -> Result<(), ClientError> {
        let tool = self.tool_mut(tool_call_id)?;
        match result {
            Ok(output) => {
                tool.transition(ToolState::OutputAvailable)?;
                tool.output = Some(output);
            }
            Err(error) => {
                tool.transition(ToolState::OutputError)?;
                tool.error_text = Some(error.to_string());
            }
        }
        Ok(())
    }

    /// Calls in the last assistant step still waiting for a client-side result
    pub fn pending_client_tool_calls(&self) -> Vec<ToolInvocation> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| {
                m.last_step()
                    .iter()
                    .filter_map(UiPart::as_tool)
                    .filter(|tool| tool.state == ToolState::InputAvailable)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn should_resubmit(&self) -> bool {
        self.status != ChatStatus::Error
            && last_assistant_message_is_complete_with_tool_calls(&self.messages)
    }
}

impl From<FileContent> for UiPart {
    fn from(file: FileContent) -> Self {
        UiPart::File {
            url: file.to_url(),
            media_type: file.media_type,
            filename: file.filename,
        }
    }
}
