use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ToolDefinition, ToolHandler};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;

fn string_argument<'a>(arguments: &'a Value, name: &str) -> AgentResult<&'a str> {
    arguments[name]
        .as_str()
        .ok_or_else(|| AgentError::InvalidParameters(format!("Missing string argument '{}'", name)))
}

/// Looks up a fixed set of landmarks and people
pub struct LocationTool;

impl LocationTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::server(
            Tool::new(
                "getLocation",
                "Get the city of a famous place or person",
                json!({
                    "type": "object",
                    "properties": {
                        "input": {
                            "type": "string",
                            "description": "The place or person to locate"
                        }
                    },
                    "required": ["input"]
                }),
            ),
            LocationTool,
        )
    }

    pub fn lookup(query: &str) -> &'static str {
        match query {
            "Minar-e-Pakistan" => "Lahore",
            "Imran Khan" => "Islamabad",
            _ => "Unknown Input",
        }
    }
}

#[async_trait]
impl ToolHandler for LocationTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let input = string_argument(&arguments, "input")?;
        Ok(json!(Self::lookup(input)))
    }
}

/// Canned weather for a few cities
pub struct MockWeatherTool;

impl MockWeatherTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::server(
            Tool::new(
                "getWeather",
                "use this to get weather data",
                json!({
                    "type": "object",
                    "properties": {
                        "city": {
                            "type": "string",
                            "description": "The city to get the weather for"
                        }
                    },
                    "required": ["city"]
                }),
            ),
            MockWeatherTool,
        )
    }

    pub fn lookup(city: &str) -> &'static str {
        match city {
            "Lahore" | "Karachi" => "52 and sunny",
            "Islamabad" => "35 and cloudy",
            _ => "Unknown City",
        }
    }
}

#[async_trait]
impl ToolHandler for MockWeatherTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let city = string_argument(&arguments, "city")?;
        Ok(json!(Self::lookup(city)))
    }
}
