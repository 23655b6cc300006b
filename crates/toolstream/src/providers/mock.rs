use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::base::{AudioInput, CompletionRequest, Provider, Usage};
use super::errors::ProviderError;
use crate::models::message::Message;

/// A mock provider that returns pre-configured responses, for tests and demos.
/// Every request it receives is recorded so callers can assert on step counts.
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<Message, ProviderError>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    image: Option<String>,
    transcript: Option<String>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
            ..Default::default()
        }
    }

    /// Create a mock provider whose responses may also be failures
    pub fn with_results(results: Vec<Result<Message, ProviderError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(results.into_iter().collect())),
            ..Default::default()
        }
    }

    pub fn with_image<S: Into<String>>(mut self, base64: S) -> Self {
        self.image = Some(base64.into());
        self
    }

    pub fn with_transcript<S: Into<String>>(mut self, transcript: S) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<(Message, Usage), ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        match next {
            Some(Ok(message)) => Ok((message, Usage::default())),
            Some(Err(err)) => Err(err),
            // Return empty response if no more pre-configured responses
            None => Ok((Message::assistant().with_text(""), Usage::default())),
        }
    }

    async fn generate_image(&self, _prompt: &str) -> Result<String, ProviderError> {
        self.image
            .clone()
            .ok_or_else(|| ProviderError::unsupported("Image generation"))
    }

    async fn speech(&self, text: &str) -> Result<Bytes, ProviderError> {
        Ok(Bytes::from(format!("ID3:{}", text)))
    }

    async fn transcribe(&self, _audio: AudioInput, _prompt: &str) -> Result<String, ProviderError> {
        self.transcript
            .clone()
            .ok_or_else(|| ProviderError::unsupported("Transcription"))
    }
}
