use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use toolstream::{prompt_template::static_prompt, providers::base::AudioInput};

use crate::error::ApiError;
use crate::state::AppState;

/// Largest accepted upload, the provider's transcription limit
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct TranscriptResponse {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct SpeechRequest {
    #[serde(default)]
    text: String,
}

async fn read_audio(mut multipart: Multipart) -> Result<Option<AudioInput>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = field.file_name().unwrap_or("audio").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        return Ok(Some(AudioInput {
            data,
            media_type,
            filename,
        }));
    }
    Ok(None)
}

async fn transcribe_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let audio = read_audio(multipart)
        .await?
        .filter(|audio| !audio.data.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No audio file provided".to_string()))?;
    tracing::info!(bytes = audio.data.len(), media_type = %audio.media_type, "transcribing");

    let provider = state.provider()?;
    let instruction = static_prompt("transcribe.md").map_err(|e| ApiError::Internal(e.to_string()))?;
    let transcript = provider.transcribe(audio, &instruction).await?;
    Ok(Json(TranscriptResponse { transcript }))
}

async fn speech_handler(
    State(state): State<AppState>,
    payload: Result<Json<SpeechRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Text is required".to_string()));
    }

    let audio = state.provider()?.speech(&request.text).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        audio,
    )
        .into_response())
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/transcribe-audio",
            post(transcribe_handler).layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES)),
        )
        .route("/api/tts", post(speech_handler))
        .with_state(state)
}
