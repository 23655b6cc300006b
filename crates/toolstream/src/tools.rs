//! Tool registry shared by the chat endpoints.
//!
//! A registry maps tool names to their description, input schema and an optional
//! server-side handler. Tools registered without a handler are client-side tools:
//! the agent loop advertises them to the model but leaves their calls for the
//! browser to execute.

pub mod demo;
pub mod http;
pub mod image;
pub mod mcp;
pub mod weather;
pub mod web_search;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;

/// Executes one tool on the server
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> AgentResult<Value>;

    /// What the model sees in place of `output`. The client always gets the
    /// untouched output.
    fn to_model_output(&self, output: &Value) -> Value {
        output.clone()
    }

    /// Web pages the output was built from, cited to the client as sources
    fn sources(&self, _output: &Value) -> Vec<Source> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub tool: Tool,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolDefinition {
    pub fn server(tool: Tool, handler: impl ToolHandler + 'static) -> Self {
        Self {
            tool,
            handler: Some(Arc::new(handler)),
        }
    }

    pub fn client(tool: Tool) -> Self {
        Self { tool, handler: None }
    }

    pub fn is_client_side(&self) -> bool {
        self.handler.is_none()
    }

    pub fn model_output(&self, output: &Value) -> Value {
        match &self.handler {
            Some(handler) => handler.to_model_output(output),
            None => output.clone(),
        }
    }

    pub fn sources(&self, output: &Value) -> Vec<Source> {
        self.handler
            .as_ref()
            .map(|handler| handler.sources(output))
            .unwrap_or_default()
    }

    /// Check `arguments` against the tool's input schema. An uncompilable schema is
    /// logged and treated as permissive.
    pub fn validate(&self, arguments: &Value) -> AgentResult<()> {
        let schema = &self.tool.input_schema;
        if !schema.is_object() {
            return Ok(());
        }
        let compiled = match jsonschema::JSONSchema::compile(schema) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::warn!(tool = %self.tool.name, "invalid tool schema: {}", e);
                return Ok(());
            }
        };

        let result = compiled.validate(arguments).map_err(|errors| {
            let messages: Vec<String> = errors
                .take(3)
                .map(|err| {
                    let path = err.instance_path.to_string();
                    if path.is_empty() {
                        err.to_string()
                    } else {
                        format!("{} at {}", err, path)
                    }
                })
                .collect();
            AgentError::InvalidParameters(messages.join("; "))
        });
        result
    }
}

/// Immutable, cheaply cloned set of tools. Built once per endpoint and shared
/// across requests; per-request tools (MCP) are merged into a fresh copy.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    definitions: Arc<Vec<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new(definitions: Vec<ToolDefinition>) -> AgentResult<Self> {
        for (i, definition) in definitions.iter().enumerate() {
            if definitions[..i]
                .iter()
                .any(|other| other.tool.name == definition.tool.name)
            {
                return Err(AgentError::Internal(format!(
                    "Duplicate tool name: {}",
                    definition.tool.name
                )));
            }
        }
        Ok(Self {
            definitions: Arc::new(definitions),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.definitions.iter().find(|d| d.tool.name == name)
    }

    /// Tool descriptions in registration order, as advertised to the model
    pub fn tools(&self) -> Vec<Tool> {
        self.definitions.iter().map(|d| d.tool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// A new registry holding `other`'s tools plus ours. Ours win on name clashes.
    pub fn merged_with(&self, other: Vec<ToolDefinition>) -> Self {
        let mut definitions: Vec<ToolDefinition> = other
            .into_iter()
            .filter(|d| self.get(&d.tool.name).is_none())
            .collect();
        definitions.extend(self.definitions.iter().cloned());
        Self {
            definitions: Arc::new(definitions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, arguments: Value) -> AgentResult<Value> {
            Ok(arguments)
        }
    }

    fn city_tool(name: &str) -> Tool {
        Tool::new(
            name,
            "echoes the city",
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        )
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ToolRegistry::new(vec![
            ToolDefinition::server(city_tool("echo"), Echo),
            ToolDefinition::client(city_tool("echo")),
        ]);
        assert!(matches!(result, Err(AgentError::Internal(_))));
    }

    #[test]
    fn test_validate_arguments() {
        let definition = ToolDefinition::server(city_tool("echo"), Echo);
        assert!(definition.validate(&json!({"city": "Lahore"})).is_ok());

        let err = definition.validate(&json!({"town": "Lahore"})).unwrap_err();
        assert!(matches!(err, AgentError::InvalidParameters(_)));

        let err = definition.validate(&json!({"city": 42})).unwrap_err();
        if let AgentError::InvalidParameters(message) = err {
            assert!(message.contains("/city"), "{}", message);
        } else {
            panic!("Expected InvalidParameters");
        }
    }

    #[test]
    fn test_merge_keeps_local_definition() {
        let registry =
            ToolRegistry::new(vec![ToolDefinition::server(city_tool("getWeather"), Echo)])
                .unwrap();
        let merged = registry.merged_with(vec![
            ToolDefinition::client(city_tool("getWeather")),
            ToolDefinition::client(city_tool("remote")),
        ]);

        assert_eq!(merged.len(), 2);
        assert!(!merged.get("getWeather").unwrap().is_client_side());
        assert!(merged.get("remote").unwrap().is_client_side());
        // the original is untouched
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_client_tool_output_is_passed_through() {
        let definition = ToolDefinition::client(city_tool("pick"));
        assert_eq!(definition.model_output(&json!("x")), json!("x"));
    }
}
