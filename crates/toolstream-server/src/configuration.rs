use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment};
use serde::Deserialize;
use std::net::SocketAddr;
use toolstream::providers::configs::{
    OpenAiProviderConfig, ProviderConfig, OPENAI_HOST, OPENAI_IMAGE_MODEL, OPENAI_MODEL,
    OPENAI_SPEECH_MODEL, OPENAI_TRANSCRIPTION_MODEL, OPENAI_VOICE,
};
use toolstream::tools::{
    image::ImageKitConfig, mcp::McpConfig, weather::WEATHER_API_BASE_URL,
    web_search::SEARCH_API_BASE_URL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_openai_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            host: default_openai_host(),
            api_key: None,
            model: default_model(),
            temperature: None,
            max_tokens: None,
            image_model: default_image_model(),
            speech_model: default_speech_model(),
            voice: default_voice(),
            transcription_model: default_transcription_model(),
        }
    }
}

impl ProviderSettings {
    pub fn to_config(&self) -> Result<ProviderConfig, ConfigError> {
        let api_key = required(&self.api_key, "provider.api_key")?;
        Ok(ProviderConfig::OpenAi(OpenAiProviderConfig {
            host: self.host.clone(),
            api_key,
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            image_model: self.image_model.clone(),
            speech_model: self.speech_model.clone(),
            voice: self.voice.clone(),
            transcription_model: self.transcription_model.clone(),
        }))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageKitSettings {
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub url_endpoint: Option<String>,
}

impl ImageKitSettings {
    pub fn to_config(&self) -> Result<ImageKitConfig, ConfigError> {
        Ok(ImageKitConfig::new(
            required(&self.public_key, "imagekit.public_key")?,
            required(&self.private_key, "imagekit.private_key")?,
            required(&self.url_endpoint, "imagekit.url_endpoint")?,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_weather_base_url(),
        }
    }
}

impl WeatherSettings {
    pub fn api_key(&self) -> Result<String, ConfigError> {
        required(&self.api_key, "weather.api_key")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_search_base_url(),
        }
    }
}

impl SearchSettings {
    pub fn api_key(&self) -> Result<String, ConfigError> {
        required(&self.api_key, "search.api_key")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl McpSettings {
    pub fn to_config(&self) -> Result<McpConfig, ConfigError> {
        let config = McpConfig::new(required(&self.url, "mcp.url")?);
        Ok(match &self.auth_token {
            Some(token) => config.with_auth_token(token),
            None => config,
        })
    }
}

/// Every section is optional: a missing key only disables the endpoints that need it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub imagekit: ImageKitSettings,
    #[serde(default)]
    pub weather: WeatherSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub mcp: McpSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Server defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Provider defaults
            .set_default("provider.host", default_openai_host())?
            .set_default("provider.model", default_model())?
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix("TOOLSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(|err| {
            tracing::debug!("Configuration error: {:?}", &err);
            match &err {
                config::ConfigError::NotFound(field) => ConfigError::MissingEnvVar {
                    env_var: to_env_var(field),
                },
                _ => ConfigError::Other(err),
            }
        })
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, ConfigError> {
    value
        .as_ref()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar {
            env_var: to_env_var(field),
        })
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_model() -> String {
    OPENAI_MODEL.to_string()
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_image_model() -> String {
    OPENAI_IMAGE_MODEL.to_string()
}

fn default_speech_model() -> String {
    OPENAI_SPEECH_MODEL.to_string()
}

fn default_voice() -> String {
    OPENAI_VOICE.to_string()
}

fn default_transcription_model() -> String {
    OPENAI_TRANSCRIPTION_MODEL.to_string()
}

fn default_weather_base_url() -> String {
    WEATHER_API_BASE_URL.to_string()
}

fn default_search_base_url() -> String {
    SEARCH_API_BASE_URL.to_string()
}
