use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use toolstream::providers::errors::ErrorKind;

use crate::error::ApiError;
use crate::state::AppState;

pub const MAX_PROMPT_CHARS: usize = 1000;

pub const IMAGE_ENDPOINT_TIMEOUT_MESSAGE: &str = "Image generation timed out. Complex prompts may take longer. Try simplifying your prompt or breaking it into smaller parts.";

fn validate_prompt(body: &Value) -> Result<&str, ApiError> {
    let prompt = body["prompt"]
        .as_str()
        .filter(|prompt| !prompt.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Prompt is required and must be a string".to_string()))?;
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest(
            "Prompt is too long. Please keep it under 1000 characters for reliable generation."
                .to_string(),
        ));
    }
    Ok(prompt)
}

/// Responds with the image as a bare base64 JSON string
async fn generate_image_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<String>, ApiError> {
    let Json(body) = payload?;
    let prompt = validate_prompt(&body)?;

    let provider = state.provider()?;
    match provider.generate_image(prompt).await {
        Ok(image) => Ok(Json(image)),
        Err(e) if e.kind == ErrorKind::Timeout => {
            tracing::warn!("image generation timed out: {}", e);
            Err(ApiError::Timeout(IMAGE_ENDPOINT_TIMEOUT_MESSAGE.to_string()))
        }
        Err(e) => {
            tracing::error!("image generation failed: {}", e);
            Err(ApiError::Internal("Failed To Generate Image".to_string()))
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/generate-image", post(generate_image_handler))
        .with_state(state)
}
