pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_MODEL: &str = "gpt-4o-mini";
pub const OPENAI_IMAGE_MODEL: &str = "dall-e-3";
pub const OPENAI_SPEECH_MODEL: &str = "tts-1";
pub const OPENAI_VOICE: &str = "alloy";
pub const OPENAI_TRANSCRIPTION_MODEL: &str = "whisper-1";

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
}

#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub image_model: String,
    pub speech_model: String,
    pub voice: String,
    pub transcription_model: String,
}

impl OpenAiProviderConfig {
    /// Configuration pointing at the public OpenAI API with default models
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            host: OPENAI_HOST.to_string(),
            api_key: api_key.into(),
            model: OPENAI_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            image_model: OPENAI_IMAGE_MODEL.to_string(),
            speech_model: OPENAI_SPEECH_MODEL.to_string(),
            voice: OPENAI_VOICE.to_string(),
            transcription_model: OPENAI_TRANSCRIPTION_MODEL.to_string(),
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }
}
