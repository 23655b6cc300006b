use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::http::{send_with_retry, tool_error, RetryPolicy};
use super::{ToolDefinition, ToolHandler};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;
use crate::providers::base::Provider;
use crate::providers::errors::{ErrorKind, ProviderError};

pub const IMAGEKIT_UPLOAD_URL: &str = "https://upload.imagekit.io";
pub const GENERATED_FILE_NAME: &str = "generated-image.jpg";
pub const BASE64_MODEL_OUTPUT: &str = "Generated Image in Base64";
pub const IMAGE_TIMEOUT_MESSAGE: &str = "Image generation timed out. The image service is experiencing connectivity issues. Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct ImageKitConfig {
    pub public_key: String,
    pub private_key: String,
    pub url_endpoint: String,
    pub upload_url: String,
}

impl ImageKitConfig {
    pub fn new<P: Into<String>, K: Into<String>, U: Into<String>>(
        public_key: P,
        private_key: K,
        url_endpoint: U,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            url_endpoint: url_endpoint.into(),
            upload_url: IMAGEKIT_UPLOAD_URL.to_string(),
        }
    }

    pub fn with_upload_url<S: Into<String>>(mut self, upload_url: S) -> Self {
        self.upload_url = upload_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    url: String,
}

/// Uploads base64 images to the ImageKit media library
pub struct ImageKitUploader {
    client: Client,
    config: ImageKitConfig,
    policy: RetryPolicy,
}

impl ImageKitUploader {
    pub fn new(config: ImageKitConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            policy: RetryPolicy::default(),
        }
    }

    /// Upload and return the hosted URL
    pub async fn upload(&self, base64_image: &str, file_name: &str) -> AgentResult<String> {
        let url = format!(
            "{}/api/v1/files/upload",
            self.config.upload_url.trim_end_matches('/')
        );
        let form = [("file", base64_image), ("fileName", file_name)];
        let request = self
            .client
            .post(url)
            .basic_auth(&self.config.private_key, Some(""))
            .form(&form);

        let response = send_with_retry(request, self.policy)
            .await
            .map_err(|e| tool_error("Image upload", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ExecutionError(format!(
                "Image upload failed with {}: {}",
                status, body
            )));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Unexpected upload payload: {}", e)))?;
        info!(url = %uploaded.url, "uploaded generated image");
        Ok(uploaded.url)
    }
}

fn image_error(err: ProviderError) -> AgentError {
    warn!("image generation failed: {}", err);
    match err.kind {
        ErrorKind::Timeout => AgentError::Timeout(IMAGE_TIMEOUT_MESSAGE.to_string()),
        _ => AgentError::ExecutionError(format!("Failed to generate image: {}", err)),
    }
}

fn prompt_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "prompt": {
                "type": "string",
                "description": "The Prompt to generate image for"
            }
        },
        "required": ["prompt"]
    })
}

/// Where `generateImage` puts its result
pub enum ImageDelivery {
    /// Upload to the CDN and return the URL
    Hosted(ImageKitUploader),
    /// Return the raw base64 payload to the client, and a short placeholder to the model
    Base64,
}

pub struct GenerateImageTool {
    provider: Arc<dyn Provider>,
    delivery: ImageDelivery,
}

impl GenerateImageTool {
    pub fn new(provider: Arc<dyn Provider>, delivery: ImageDelivery) -> Self {
        Self { provider, delivery }
    }

    pub fn into_definition(self) -> ToolDefinition {
        ToolDefinition::server(
            Tool::new(
                "generateImage",
                "Use this tool to generate images",
                prompt_schema(),
            ),
            self,
        )
    }
}

#[async_trait]
impl ToolHandler for GenerateImageTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let prompt = arguments["prompt"].as_str().ok_or_else(|| {
            AgentError::InvalidParameters("Missing string argument 'prompt'".into())
        })?;

        let image = self
            .provider
            .generate_image(prompt)
            .await
            .map_err(image_error)?;

        match &self.delivery {
            ImageDelivery::Hosted(uploader) => {
                let url = uploader.upload(&image, GENERATED_FILE_NAME).await?;
                Ok(json!(url))
            }
            ImageDelivery::Base64 => Ok(json!(image)),
        }
    }

    fn to_model_output(&self, output: &Value) -> Value {
        match self.delivery {
            ImageDelivery::Hosted(_) => output.clone(),
            ImageDelivery::Base64 => json!(BASE64_MODEL_OUTPUT),
        }
    }
}

const IMAGE_URL_DESCRIPTION: &str = "URL of the image to process. Use the URL from the most recent generateImage tool result if the user refers to a recent image.";

/// CDN transformations the browser applies to an existing image
#[derive(Debug, Clone, PartialEq)]
pub enum Transformation {
    RemoveBackground,
    ChangeBackground(String),
}

impl Transformation {
    pub fn as_param(&self) -> String {
        match self {
            Transformation::RemoveBackground => "e-bgremove".to_string(),
            Transformation::ChangeBackground(prompt) => {
                format!("e-changebg-prompt-{}", urlencoding::encode(prompt))
            }
        }
    }
}

/// Append a `tr=` transformation to an image URL, respecting any existing query
pub fn transformation_url(image_url: &str, transformation: &Transformation) -> String {
    let separator = if image_url.contains('?') { '&' } else { '?' };
    format!("{}{}tr={}", image_url, separator, transformation.as_param())
}

/// `removeBackground`: executed by the client
pub struct RemoveBackgroundTool;

impl RemoveBackgroundTool {
    pub fn tool() -> Tool {
        Tool::new(
            "removeBackground",
            "Use this tool to remove background of an image. When the user refers to a recent image (e.g., 'the toy image', 'that image', 'the previous image'), look at the conversation history to find the most recently generated image URL and use that.",
            json!({
                "type": "object",
                "properties": {
                    "imageUrl": {"type": "string", "description": IMAGE_URL_DESCRIPTION}
                },
                "required": ["imageUrl"]
            }),
        )
    }

    /// Server-side registration: advertised to the model, never executed there
    pub fn definition() -> ToolDefinition {
        ToolDefinition::client(Self::tool())
    }
}

#[async_trait]
impl ToolHandler for RemoveBackgroundTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let image_url = arguments["imageUrl"].as_str().ok_or_else(|| {
            AgentError::InvalidParameters("Missing string argument 'imageUrl'".into())
        })?;
        Ok(json!(transformation_url(image_url, &Transformation::RemoveBackground)))
    }
}

/// `changeBackground`: executed by the client
pub struct ChangeBackgroundTool;

impl ChangeBackgroundTool {
    pub fn tool() -> Tool {
        Tool::new(
            "changeBackground",
            "Use this tool to change background of an image. When the user refers to a recent image (e.g., 'the toy image', 'that image', 'the previous image'), look at the conversation history to find the most recently generated image URL and use that.",
            json!({
                "type": "object",
                "properties": {
                    "imageUrl": {"type": "string", "description": IMAGE_URL_DESCRIPTION},
                    "backgroundPrompt": {
                        "type": "string",
                        "description": "Description of the new background"
                    }
                },
                "required": ["imageUrl", "backgroundPrompt"]
            }),
        )
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition::client(Self::tool())
    }
}

#[async_trait]
impl ToolHandler for ChangeBackgroundTool {
    async fn call(&self, arguments: Value) -> AgentResult<Value> {
        let (Some(image_url), Some(prompt)) = (
            arguments["imageUrl"].as_str(),
            arguments["backgroundPrompt"].as_str(),
        ) else {
            return Err(AgentError::InvalidParameters(
                "Expected string arguments 'imageUrl' and 'backgroundPrompt'".into(),
            ));
        };
        let transformation = Transformation::ChangeBackground(prompt.to_string());
        Ok(json!(transformation_url(image_url, &transformation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_transformation_url_separator() {
        assert_eq!(
            transformation_url("https://ik.imagekit.io/demo/a.jpg", &Transformation::RemoveBackground),
            "https://ik.imagekit.io/demo/a.jpg?tr=e-bgremove"
        );
        assert_eq!(
            transformation_url(
                "https://ik.imagekit.io/demo/a.jpg?updatedAt=1",
                &Transformation::ChangeBackground("snowy mountains".into())
            ),
            "https://ik.imagekit.io/demo/a.jpg?updatedAt=1&tr=e-changebg-prompt-snowy%20mountains"
        );
    }

    #[tokio::test]
    async fn test_client_tools_build_urls() {
        let output = ChangeBackgroundTool
            .call(json!({"imageUrl": "https://cdn/x.png", "backgroundPrompt": "beach"}))
            .await
            .unwrap();
        assert_eq!(output, json!("https://cdn/x.png?tr=e-changebg-prompt-beach"));

        assert!(RemoveBackgroundTool::definition().is_client_side());
        assert!(ChangeBackgroundTool::definition().is_client_side());
    }

    #[tokio::test]
    async fn test_base64_delivery_hides_payload_from_model() {
        let provider = Arc::new(MockProvider::default().with_image("aW1hZ2U="));
        let tool = GenerateImageTool::new(provider, ImageDelivery::Base64);
        let output = tool.call(json!({"prompt": "a cat"})).await.unwrap();

        assert_eq!(output, json!("aW1hZ2U="));
        assert_eq!(tool.to_model_output(&output), json!(BASE64_MODEL_OUTPUT));
    }

    #[tokio::test]
    async fn test_hosted_delivery_uploads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files/upload"))
            .and(header_exists("authorization"))
            .and(body_string_contains("fileName=generated-image.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fileId": "f1",
                "name": "generated-image.jpg",
                "url": "https://ik.imagekit.io/demo/generated-image.jpg"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = ImageKitUploader::new(
            ImageKitConfig::new("public", "private", "https://ik.imagekit.io/demo")
                .with_upload_url(server.uri()),
        );
        let provider = Arc::new(MockProvider::default().with_image("aW1hZ2U="));
        let tool = GenerateImageTool::new(provider, ImageDelivery::Hosted(uploader));

        let output = tool.call(json!({"prompt": "a toy"})).await.unwrap();
        assert_eq!(
            output,
            json!("https://ik.imagekit.io/demo/generated-image.jpg")
        );
        assert_eq!(tool.to_model_output(&output), output);
    }

    #[tokio::test]
    async fn test_provider_failure_is_tool_error() {
        let provider = Arc::new(MockProvider::default());
        let tool = GenerateImageTool::new(provider, ImageDelivery::Base64);
        let err = tool.call(json!({"prompt": "a cat"})).await.unwrap_err();
        assert!(matches!(err, AgentError::ExecutionError(_)));
    }
}
