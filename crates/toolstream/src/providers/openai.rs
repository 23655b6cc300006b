use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{
    AudioInput, CompletionRequest, FinishReason, Provider, ProviderEvent, ProviderStream, Usage,
};
use super::configs::OpenAiProviderConfig;
use super::errors::{ErrorKind, ProviderError};
use super::utils::{
    messages_to_openai_spec, openai_error_to_provider_error, openai_response_to_message,
    tools_to_openai_spec,
};
use crate::models::message::Message;
use crate::sse::parse_sse_stream;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.host.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    fn get_usage(data: &Value) -> Usage {
        let Some(usage) = data.get("usage").filter(|u| !u.is_null()) else {
            return Usage::default();
        };

        let input_tokens = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .or_else(|| match (input_tokens, output_tokens) {
                (Some(input), Some(output)) => Some(input + output),
                _ => None,
            });

        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    /// Turn a non-2xx response into a classified error
    async fn error_from_response(response: Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("error").cloned());

        let mut err = match &error {
            Some(error) => openai_error_to_provider_error(error),
            None => ProviderError::from_message(format!("Request failed: {}\n{}", status, body)),
        };
        match ErrorKind::from_status(status.as_u16()) {
            ErrorKind::Other => {}
            kind => err.kind = kind,
        }
        err
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        let response = self.authorized(builder).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            _ => Err(Self::error_from_response(response).await),
        }
    }

    fn build_payload(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<Value, ProviderError> {
        let mut messages_array = Vec::new();
        // Not checking for o1 model here since system message is not supported by o1
        if !request.system.is_empty() {
            messages_array.push(json!({
                "role": "system",
                "content": request.system
            }));
        }
        messages_array.extend(messages_to_openai_spec(&request.messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(&request.tools)?);
        }
        if let Some(format) = &request.response_format {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                }
            });
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }

        Ok(payload)
    }
}

/// Translate one streamed chat completion chunk into provider events
fn chunk_to_events(chunk: &Value, finish: &mut Option<FinishReason>) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let Some(choice) = chunk["choices"].as_array().and_then(|c| c.first()) else {
        return events;
    };
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            events.push(ProviderEvent::TextDelta(text.to_string()));
        }
    }

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for (position, tool_call) in tool_calls.iter().enumerate() {
            let index = tool_call["index"]
                .as_u64()
                .map(|i| i as usize)
                .unwrap_or(position);
            if let (Some(id), Some(name)) = (
                tool_call["id"].as_str(),
                tool_call["function"]["name"].as_str(),
            ) {
                events.push(ProviderEvent::ToolCallStart {
                    index,
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
            if let Some(arguments) = tool_call["function"]["arguments"].as_str() {
                if !arguments.is_empty() {
                    events.push(ProviderEvent::ToolCallDelta {
                        index,
                        arguments: arguments.to_string(),
                    });
                }
            }
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        *finish = Some(FinishReason::from_openai(reason));
    }

    events
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<(Message, Usage), ProviderError> {
        let payload = self.build_payload(request, false)?;
        let response: Value = self
            .send(self.client.post(self.url("chat/completions")).json(&payload))
            .await?
            .json()
            .await?;

        // Some compatible hosts return errors with a 200 status
        if let Some(error) = response.get("error") {
            return Err(openai_error_to_provider_error(error));
        }

        let message = openai_response_to_message(response.clone())?;
        let usage = Self::get_usage(&response);

        Ok((message, usage))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ProviderStream, ProviderError> {
        let payload = self.build_payload(request, true)?;
        let response = self
            .send(self.client.post(self.url("chat/completions")).json(&payload))
            .await?;
        let mut events = parse_sse_stream(response.bytes_stream());

        let stream = async_stream::try_stream! {
            let mut finish = None;
            let mut usage = Usage::default();

            while let Some(event) = events.next().await {
                let event = event.map_err(|e| ProviderError::from_message(e.to_string()))?;
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: Value = serde_json::from_str(&event.data)?;
                if let Some(error) = chunk.get("error") {
                    Err(openai_error_to_provider_error(error))?;
                }
                if chunk.get("usage").is_some_and(|u| !u.is_null()) {
                    usage = Self::get_usage(&chunk);
                }
                for provider_event in chunk_to_events(&chunk, &mut finish) {
                    yield provider_event;
                }
            }

            yield ProviderEvent::Finish {
                reason: finish.unwrap_or(FinishReason::Stop),
                usage,
            };
        };

        Ok(Box::pin(stream))
    }

    async fn generate_image(&self, prompt: &str) -> Result<String, ProviderError> {
        let payload = json!({
            "model": self.config.image_model,
            "prompt": prompt,
            "size": "1792x1024",
            "response_format": "b64_json",
        });
        let response: Value = self
            .send(self.client.post(self.url("images/generations")).json(&payload))
            .await?
            .json()
            .await?;

        response["data"][0]["b64_json"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::new(ErrorKind::Other, "No image data returned from the model."))
    }

    async fn speech(&self, text: &str) -> Result<Bytes, ProviderError> {
        let payload = json!({
            "model": self.config.speech_model,
            "input": text,
            "voice": self.config.voice,
            "response_format": "mp3",
        });
        let response = self
            .send(self.client.post(self.url("audio/speech")).json(&payload))
            .await?;
        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(ProviderError::new(
                ErrorKind::Other,
                "No audio data returned from the model.",
            ));
        }
        Ok(audio)
    }

    async fn transcribe(&self, audio: AudioInput, prompt: &str) -> Result<String, ProviderError> {
        let file = reqwest::multipart::Part::bytes(audio.data.to_vec())
            .file_name(audio.filename)
            .mime_str(&audio.media_type)?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.config.transcription_model.clone())
            .text("prompt", prompt.to_string());

        let response: Value = self
            .send(self.client.post(self.url("audio/transcriptions")).multipart(form))
            .await?
            .json()
            .await?;

        response["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::new(ErrorKind::Other, "No transcript returned from the model."))
    }
}

/// Decode the base64 payload providers hand back for binary outputs
pub fn decode_base64(data: &str) -> Result<Vec<u8>, ProviderError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ProviderError::new(ErrorKind::Other, format!("Invalid base64 payload: {}", e)))
}
