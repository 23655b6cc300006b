use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::errors::{ErrorKind, ProviderError};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::FileContent;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });

        let mut parts = Vec::new();
        let mut has_file = false;
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        parts.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::File(file) => {
                    has_file = true;
                    parts.push(convert_file(file));
                }
                MessageContent::ToolRequest(request) => match &request.tool_call {
                    Ok(tool_call) => {
                        let sanitized_name = sanitize_function_name(&tool_call.name);
                        let entry = json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": sanitized_name,
                                "arguments": tool_call.arguments.to_string(),
                            }
                        });
                        match converted.get_mut("tool_calls").and_then(Value::as_array_mut) {
                            Some(tool_calls) => tool_calls.push(entry),
                            None => converted["tool_calls"] = json!([entry]),
                        }
                    }
                    Err(e) => {
                        output.push(json!({
                            "role": "tool",
                            "content": format!("Error: {}", e),
                            "tool_call_id": request.id
                        }));
                    }
                },
                MessageContent::ToolResponse(response) => {
                    let content = match &response.tool_result {
                        Ok(Value::String(text)) => text.clone(),
                        Ok(value) => value.to_string(),
                        // A tool result error is shown as output so the model can interpret the error message
                        Err(e) => format!("The tool call returned the following error:\n{}", e),
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": response.id
                    }));
                }
            }
        }

        if has_file {
            converted["content"] = json!(parts);
        } else if !parts.is_empty() {
            let text: String = parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
            converted["content"] = json!(text);
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert a file attachment into an OpenAI content part
pub fn convert_file(file: &FileContent) -> Value {
    if file.is_image() {
        json!({
            "type": "image_url",
            "image_url": {
                "url": file.to_url()
            }
        })
    } else {
        json!({
            "type": "file",
            "file": {
                "filename": file.filename.clone().unwrap_or_else(|| "attachment".to_string()),
                "file_data": file.to_url(),
            }
        })
    }
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::new(
                ErrorKind::Other,
                format!("Duplicate tool name: {}", tool.name),
            ));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Turn the raw argument text the model produced into a tool call
pub fn parse_tool_call(id: &str, function_name: &str, arguments: &str) -> AgentResult<ToolCall> {
    if !is_valid_function_name(function_name) {
        return Err(AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            function_name
        )));
    }

    // Some models send an empty string for tools without parameters
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };

    serde_json::from_str::<Value>(arguments)
        .map(|params| ToolCall::new(function_name, params))
        .map_err(|e| {
            AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ))
        })
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message, ProviderError> {
    let original = response["choices"][0]["message"].clone();
    let mut content = Vec::new();

    if let Some(text_str) = original.get("content").and_then(Value::as_str) {
        content.push(MessageContent::text(text_str));
    }

    if let Some(tool_calls_array) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls_array {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"].as_str().unwrap_or_default();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            let parsed = parse_tool_call(&id, function_name, arguments);
            content.push(MessageContent::tool_request(id, parsed));
        }
    }

    Ok(Message {
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content,
    })
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_FUNCTION_NAME.is_match(name)
}

/// Classify an OpenAI `error` object. Context overflows get their own kind, everything
/// else falls back to text classification.
pub fn openai_error_to_provider_error(error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(String::from)
        .unwrap_or_else(|| error.to_string());
    let code = error.get("code").and_then(|c| c.as_str()).unwrap_or_default();

    if code == "context_length_exceeded" || code == "string_above_max_length" {
        ProviderError::new(
            ErrorKind::ContextLengthExceeded,
            format!("Context length exceeded. Message: {}", message),
        )
    } else if code == "rate_limit_exceeded" || code == "insufficient_quota" {
        ProviderError::new(ErrorKind::RateLimited, message)
    } else {
        ProviderError::from_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content::Content;
    use anyhow::Result;

    const OPENAI_TOOL_USE_RESPONSE: &str = r#"{
        "choices": [{
            "role": "assistant",
            "message": {
                "tool_calls": [{
                    "id": "1",
                    "function": {
                        "name": "example_fn",
                        "arguments": "{\"param\": \"value\"}"
                    }
                }]
            }
        }],
        "usage": {
            "input_tokens": 10,
            "output_tokens": 25,
            "total_tokens": 35
        }
    }"#;

    #[test]
    fn test_messages_to_openai_spec() -> Result<()> {
        let message = Message::user().with_text("Hello");
        let spec = messages_to_openai_spec(&[message]);

        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["role"], "user");
        assert_eq!(spec[0]["content"], "Hello");
        Ok(())
    }

    #[test]
    fn test_messages_with_image_use_content_parts() -> Result<()> {
        let file = Content::file_from_url("data:image/png;base64,aGVsbG8=", "image/png");
        let message = Message::user()
            .with_text("What is in this picture?")
            .with_content(file.into());
        let spec = messages_to_openai_spec(&[message]);

        assert_eq!(spec.len(), 1);
        let parts = spec[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );
        Ok(())
    }

    #[test]
    fn test_tools_to_openai_spec() -> Result<()> {
        let tool = Tool::new(
            "test_tool",
            "A test tool",
            json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "Test parameter"
                    }
                },
                "required": ["input"]
            }),
        );

        let spec = tools_to_openai_spec(&[tool])?;

        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["type"], "function");
        assert_eq!(spec[0]["function"]["name"], "test_tool");
        Ok(())
    }

    #[test]
    fn test_function_names() {
        assert!(is_valid_function_name("getWeather"));
        assert!(is_valid_function_name("remove-background_v2"));
        assert!(!is_valid_function_name("get weather"));
        assert_eq!(sanitize_function_name("weather.lookup"), "weather_lookup");
        assert_eq!(sanitize_function_name("getWeather"), "getWeather");
    }

    #[test]
    fn test_tool_round_trip_spec() -> Result<()> {
        let messages = vec![
            Message::user().with_text("Weather in Lahore?"),
            Message::assistant()
                .with_text("Checking.")
                .with_tool_request(
                    "call_1",
                    Ok(ToolCall::new("getWeather", json!({"city": "Lahore"}))),
                ),
            Message::user().with_tool_response("call_1", Ok(json!({"temperature": 31}))),
        ];

        let spec = messages_to_openai_spec(&messages);

        assert_eq!(spec.len(), 3);
        assert_eq!(spec[1]["role"], "assistant");
        assert_eq!(spec[1]["content"], "Checking.");
        assert_eq!(spec[1]["tool_calls"][0]["function"]["name"], "getWeather");
        assert_eq!(
            spec[1]["tool_calls"][0]["function"]["arguments"],
            r#"{"city":"Lahore"}"#
        );
        assert_eq!(spec[2]["role"], "tool");
        assert_eq!(spec[2]["content"], r#"{"temperature":31}"#);
        assert_eq!(spec[2]["tool_call_id"], "call_1");

        Ok(())
    }

    #[test]
    fn test_tool_error_is_shown_to_model() {
        let messages = vec![Message::user().with_tool_response(
            "tool1",
            Err(AgentError::ExecutionError("weather service down".into())),
        )];
        let spec = messages_to_openai_spec(&messages);
        assert_eq!(spec.len(), 1);
        assert!(spec[0]["content"]
            .as_str()
            .unwrap()
            .contains("weather service down"));
    }

    #[test]
    fn test_tools_to_openai_spec_duplicate() {
        let tool = Tool::new("test_tool", "Test tool", json!({"type": "object"}));
        let result = tools_to_openai_spec(&[tool.clone(), tool]);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate tool name"));
    }

    #[test]
    fn test_openai_response_to_message_text() -> Result<()> {
        let response = json!({
            "choices": [{
                "role": "assistant",
                "message": {
                    "content": "Hello from the model!"
                }
            }]
        });

        let message = openai_response_to_message(response)?;
        assert_eq!(message.content.len(), 1);
        assert_eq!(message.text(), "Hello from the model!");
        assert!(matches!(message.role, Role::Assistant));

        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_valid_toolrequest() -> Result<()> {
        let response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        let message = openai_response_to_message(response)?;

        assert_eq!(message.content.len(), 1);
        if let MessageContent::ToolRequest(request) = &message.content[0] {
            let tool_call = request.tool_call.as_ref().unwrap();
            assert_eq!(tool_call.name, "example_fn");
            assert_eq!(tool_call.arguments, json!({"param": "value"}));
        } else {
            panic!("Expected ToolRequest content");
        }

        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_invalid_func_name() -> Result<()> {
        let mut response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        response["choices"][0]["message"]["tool_calls"][0]["function"]["name"] =
            json!("invalid fn");

        let message = openai_response_to_message(response)?;

        if let MessageContent::ToolRequest(request) = &message.content[0] {
            match &request.tool_call {
                Err(AgentError::ToolNotFound(msg)) => {
                    assert!(msg.starts_with("The provided function name"));
                }
                _ => panic!("Expected ToolNotFound error"),
            }
        } else {
            panic!("Expected ToolRequest content");
        }

        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_json_decode_error() -> Result<()> {
        let mut response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"] =
            json!("invalid json {");

        let message = openai_response_to_message(response)?;

        if let MessageContent::ToolRequest(request) = &message.content[0] {
            match &request.tool_call {
                Err(AgentError::InvalidParameters(msg)) => {
                    assert!(msg.starts_with("Could not interpret tool use parameters"));
                }
                _ => panic!("Expected InvalidParameters error"),
            }
        } else {
            panic!("Expected ToolRequest content");
        }

        Ok(())
    }

    #[test]
    fn test_empty_arguments_are_an_empty_object() {
        let call = parse_tool_call("call_1", "listTools", "").unwrap();
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_openai_error_classification() {
        let error = json!({
            "code": "context_length_exceeded",
            "message": "This message is too long"
        });
        let err = openai_error_to_provider_error(&error);
        assert_eq!(err.kind, ErrorKind::ContextLengthExceeded);
        assert_eq!(
            err.to_string(),
            "Context length exceeded. Message: This message is too long"
        );

        let error = json!({
            "code": "insufficient_quota",
            "message": "You exceeded your current quota"
        });
        assert_eq!(
            openai_error_to_provider_error(&error).kind,
            ErrorKind::RateLimited
        );

        let error = json!({"code": "other_error", "message": "Some other error"});
        assert_eq!(openai_error_to_provider_error(&error).kind, ErrorKind::Other);
    }
}
