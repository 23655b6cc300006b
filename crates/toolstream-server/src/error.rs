use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use toolstream::{
    errors::AgentError,
    providers::errors::{ErrorKind, ProviderError},
    structured::StructuredError,
    tools::{image::IMAGE_TIMEOUT_MESSAGE, mcp::McpError},
};

pub const QUOTA_EXCEEDED_MESSAGE: &str = "API quota exceeded. Please wait a minute before trying again, or upgrade your plan for higher limits.";
pub const UPSTREAM_TIMEOUT_MESSAGE: &str =
    "The model service timed out. Please try again in a moment.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Environment variable backing a dotted settings key, e.g. `provider.api_key`
pub fn to_env_var(field: &str) -> String {
    format!("TOOLSTREAM_{}", field.to_uppercase().replace('.', "__"))
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Failures that end a request before any stream has been committed
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tool(#[from] AgentError),

    #[error("Remote tools unavailable: {0}")]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Structured(#[from] StructuredError),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Text of the `error` chunk sent when a reply fails after streaming started
pub fn describe_stream_error(err: &ProviderError) -> String {
    match err.kind {
        ErrorKind::RateLimited => QUOTA_EXCEEDED_MESSAGE.to_string(),
        ErrorKind::Timeout => UPSTREAM_TIMEOUT_MESSAGE.to_string(),
        _ => err.message.clone(),
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Provider(err) => StatusCode::from_u16(err.kind.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ApiError::Timeout(_)
            | ApiError::Tool(AgentError::Timeout(_))
            | ApiError::Mcp(McpError::Timeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Provider(err) => describe_stream_error(err),
            ApiError::Tool(AgentError::Timeout(_)) => IMAGE_TIMEOUT_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {}", self);
        } else {
            tracing::warn!(status = status.as_u16(), "request rejected: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.message(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("provider.api_key"), "TOOLSTREAM_PROVIDER__API_KEY");
        assert_eq!(to_env_var("mcp.url"), "TOOLSTREAM_MCP__URL");
    }

    #[test]
    fn test_status_codes() {
        let rate = ApiError::from(ProviderError::new(ErrorKind::RateLimited, "quota"));
        assert_eq!(rate.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rate.message(), QUOTA_EXCEEDED_MESSAGE);

        let timeout = ApiError::from(ProviderError::from_message("Connect Timeout Error"));
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let other = ApiError::from(ProviderError::from_message("boom"));
        assert_eq!(other.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(other.message(), "boom");

        let image = ApiError::from(AgentError::Timeout("flux".into()));
        assert_eq!(image.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(image.message(), IMAGE_TIMEOUT_MESSAGE);

        let missing = ApiError::from(ConfigError::MissingEnvVar {
            env_var: to_env_var("weather.api_key"),
        });
        assert_eq!(missing.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(missing.message().contains("TOOLSTREAM_WEATHER__API_KEY"));
    }
}
