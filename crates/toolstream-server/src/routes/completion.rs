use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use toolstream::{
    agent::Agent,
    models::message::Message,
    prompt_template::static_prompt,
    providers::base::CompletionRequest,
};

use super::reply::{prime, stream_reply, SseResponse};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct PromptRequest {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct CompletionResponse {
    text: String,
}

fn completion_system() -> Result<String, ApiError> {
    static_prompt("completion.md").map_err(|e| ApiError::Internal(e.to_string()))
}

// simple ask an AI for a response, non streaming
async fn completion_handler(
    State(state): State<AppState>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let Json(request) = payload?;
    let provider = state.provider()?;

    let completion = CompletionRequest::new(
        completion_system()?,
        vec![Message::user().with_text(request.prompt)],
    );
    let (message, usage) = provider.complete(&completion).await?;
    tracing::info!(
        input_tokens = ?usage.input_tokens,
        output_tokens = ?usage.output_tokens,
        "completion finished"
    );

    Ok(Json(CompletionResponse {
        text: message.text(),
    }))
}

async fn stream_handler(
    State(state): State<AppState>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<SseResponse, ApiError> {
    let Json(request) = payload?;
    let agent = Agent::new(state.provider()?).with_system(completion_system()?);

    let events = prime(agent.reply(vec![Message::user().with_text(request.prompt)])).await?;
    Ok(stream_reply(events, None))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/completion", post(completion_handler))
        .route("/api/stream", post(stream_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Settings;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use toolstream::providers::mock::MockProvider;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_completion_returns_text() {
        let provider = MockProvider::new(vec![Message::assistant().with_text("Use a Vec.")]);
        let app = routes(AppState::with_provider(Settings::default(), Arc::new(provider.clone())));

        let response = app
            .oneshot(post_json("/api/completion", json!({"prompt": "list type?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"text": "Use a Vec."}));
        assert!(provider.requests()[0].system.contains("under 2 sentences"));
    }

    #[tokio::test]
    async fn test_stream_uses_ui_protocol() {
        let provider = MockProvider::new(vec![Message::assistant().with_text("Streaming.")]);
        let app = routes(AppState::with_provider(Settings::default(), Arc::new(provider)));

        let response = app
            .oneshot(post_json("/api/stream", json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.starts_with("data: {\"type\":\"start\""));
        assert!(body.contains("\"delta\":\"Streaming.\""));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_missing_provider_key_is_503() {
        let app = routes(AppState::new(Settings::default()));
        let response = app
            .oneshot(post_json("/api/completion", json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
