use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use toolstream::{
    models::message::Message,
    prompt_template::render_prompt,
    providers::base::{CompletionRequest, ProviderEvent, ProviderStream, ResponseFormat},
    structured::{
        array_schema, enum_schema, parse_enum_result, validate_object, ElementStream,
    },
};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

pub const SENTIMENTS: &[&str] = &["positive", "negative", "neutral"];

pub fn recipe_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "recipe": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "ingredients": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "amount": {"type": "string"}
                            },
                            "required": ["name", "amount"]
                        }
                    },
                    "steps": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["name", "ingredients", "steps"]
            }
        },
        "required": ["recipe"]
    })
}

pub fn pokemon_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "abilities": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["name", "abilities"]
    })
}

#[derive(Debug, Deserialize)]
struct RecipeRequest {
    dish: String,
}

#[derive(Debug, Deserialize)]
struct PokemonRequest {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct SentimentRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct SentimentResponse {
    result: String,
}

fn prompt(name: &str, context: Value) -> Result<String, ApiError> {
    render_prompt(name, &context).map_err(|e| ApiError::Internal(e.to_string()))
}

fn text_stream(rx: mpsc::Receiver<Result<String, std::io::Error>>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(rx).map(|r| r.map(Bytes::from)));
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn open_stream(
    state: &AppState,
    user_prompt: String,
    format: ResponseFormat,
) -> Result<ProviderStream, ApiError> {
    let provider = state.provider()?;
    let request = CompletionRequest::new("", vec![Message::user().with_text(user_prompt)])
        .with_response_format(format);
    Ok(provider.stream(&request).await?)
}

/// Stream the object's JSON text as it is generated
async fn recipe_handler(
    State(state): State<AppState>,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let schema = recipe_schema();
    let mut events = open_stream(
        &state,
        prompt("recipe.md", json!({"dish": request.dish}))?,
        ResponseFormat::new("recipe", schema.clone()),
    )
    .await?;

    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let mut text = String::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(ProviderEvent::TextDelta(delta)) => {
                    text.push_str(&delta);
                    if tx.send(Ok(delta)).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("recipe stream failed: {}", e);
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }

        // a recipe that does not match its schema aborts the body instead of ending it cleanly
        let checked = serde_json::from_str::<Value>(&text)
            .map_err(|e| format!("recipe is not valid JSON: {}", e))
            .and_then(|value| {
                validate_object(&value, &schema)
                    .map_err(|e| format!("recipe does not match its schema: {}", e))
            });
        if let Err(message) = checked {
            warn!("{}", message);
            let _ = tx.send(Err(std::io::Error::other(message))).await;
        }
    });

    Ok(text_stream(rx))
}

/// Stream a JSON array that only ever contains completed elements
async fn pokemon_handler(
    State(state): State<AppState>,
    payload: Result<Json<PokemonRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let mut events = open_stream(
        &state,
        prompt("pokemon.md", json!({"type": request.kind}))?,
        ResponseFormat::new("pokemon", array_schema(pokemon_schema())),
    )
    .await?;

    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let mut elements = ElementStream::new();
        let mut written = 0usize;

        let frame = |values: Vec<Value>, written: &mut usize| -> String {
            let mut out = String::new();
            for value in values {
                out.push(if *written == 0 { '[' } else { ',' });
                out.push_str(&value.to_string());
                *written += 1;
            }
            out
        };

        while let Some(event) = events.next().await {
            match event {
                Ok(ProviderEvent::TextDelta(delta)) => {
                    let text = frame(elements.push(&delta), &mut written);
                    if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("pokemon stream failed: {}", e);
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }

        match elements.finish() {
            Ok(rest) => {
                let mut text = frame(rest, &mut written);
                if written == 0 {
                    text.push('[');
                }
                text.push(']');
                let _ = tx.send(Ok(text)).await;
            }
            Err(e) => {
                warn!("pokemon list is not valid: {}", e);
                let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
            }
        }
    });

    Ok(text_stream(rx))
}

async fn sentiment_handler(
    State(state): State<AppState>,
    payload: Result<Json<SentimentRequest>, JsonRejection>,
) -> Result<Json<SentimentResponse>, ApiError> {
    let Json(request) = payload?;
    let provider = state.provider()?;
    let completion = CompletionRequest::new(
        "",
        vec![Message::user().with_text(prompt("sentiment.md", json!({"text": request.text}))?)],
    )
    .with_response_format(ResponseFormat::new("sentiment", enum_schema(SENTIMENTS)));

    let (message, _) = provider.complete(&completion).await?;
    let result = parse_enum_result(&message.text(), SENTIMENTS)?;
    Ok(Json(SentimentResponse { result }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/structured-data", post(recipe_handler))
        .route("/api/structured-array", post(pokemon_handler))
        .route("/api/structured-enums", post(sentiment_handler))
        .with_state(state)
}
