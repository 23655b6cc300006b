use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::http::{send_with_retry, tool_error, RetryPolicy};
use super::{ToolDefinition, ToolHandler};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;

pub const WEATHER_API_BASE_URL: &str = "https://api.weatherapi.com/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherLocation {
    pub name: String,
    pub country: String,
    pub localtime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherCondition {
    pub text: String,
    pub code: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temp_c: f64,
    pub condition: WeatherCondition,
}

/// The subset of the weatherapi.com `current.json` payload handed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub location: WeatherLocation,
    pub current: CurrentWeather,
}

/// Live weather from weatherapi.com
pub struct WeatherApiTool {
    client: Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl WeatherApiTool {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            client: Client::new(),
            base_url: WEATHER_API_BASE_URL.to_string(),
            api_key: api_key.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn into_definition(self) -> ToolDefinition {
        ToolDefinition::server(
            Tool::new(
                "getWeather",
                "Get the current weather for a city",
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
            self,
        )
    }

    pub async fn fetch(&self, city: &str) -> AgentResult<WeatherReport> {
        let url = format!("{}/current.json", self.base_url.trim_end_matches('/'));
        let request = self
            .client
            .get(url)
            .query(&[("key", self.api_key.as_str()), ("q", city)]);

        let response = send_with_retry(request, self.policy)
            .await
            .map_err(|e| tool_error("Weather service", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(AgentError::ExecutionError(format!(
                "Weather service returned {}: {}",
                status, message
            )));
        }

        response
            .json::<WeatherReport>()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Unexpected weather payload: {}", e)))
    }
}

#[async_trait]
impl ToolHandler for WeatherApiTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let city = arguments["city"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidParameters("Missing string argument 'city'".into()))?;

        let report = self.fetch(city).await.map_err(|e| {
            tracing::warn!(city, "weather lookup failed: {}", e);
            e
        })?;
        serde_json::to_value(report).map_err(|e| AgentError::Internal(e.to_string()))
    }
}
