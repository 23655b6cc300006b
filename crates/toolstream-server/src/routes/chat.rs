//! Chat endpoints. They differ only in system prompt, tools and step cap, so every
//! route is one [`ChatEndpoint`] served by the same handler.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use toolstream::{
    agent::Agent,
    prompt_template::static_prompt,
    providers::base::Provider,
    tools::{
        demo::{LocationTool, MockWeatherTool},
        image::{
            ChangeBackgroundTool, GenerateImageTool, ImageDelivery, ImageKitUploader,
            RemoveBackgroundTool,
        },
        mcp::McpClient,
        weather::WeatherApiTool,
        web_search::WebSearchTool,
        ToolRegistry,
    },
    ui::{ui_messages_to_messages, ChatRequest},
};
use tracing::{info, warn};

use super::reply::{prime, stream_reply, SseResponse};
use crate::error::ApiError;
use crate::state::AppState;

/// Which tools an endpoint exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    None,
    /// `getLocation` and the canned `getWeather`
    Demo,
    /// `getWeather` backed by weatherapi.com
    WeatherApi,
    /// `generateImage` uploading to ImageKit, plus the browser-side image edits
    ImageEditing,
    /// `generateImage` returning base64
    Base64Image,
    /// Tools listed by the remote MCP server, plus the canned `getWeather`
    Mcp,
    /// `webSearch` backed by the search API
    WebSearch,
}

impl ToolSet {
    fn registry(&self, state: &AppState, provider: Arc<dyn Provider>) -> Result<ToolRegistry, ApiError> {
        let definitions = match self {
            ToolSet::None => Vec::new(),
            ToolSet::Demo => vec![LocationTool::definition(), MockWeatherTool::definition()],
            ToolSet::WeatherApi => {
                let weather = &state.settings.weather;
                vec![WeatherApiTool::new(weather.api_key()?)
                    .with_base_url(&weather.base_url)
                    .into_definition()]
            }
            ToolSet::ImageEditing => {
                let uploader = ImageKitUploader::new(state.settings.imagekit.to_config()?);
                vec![
                    GenerateImageTool::new(provider, ImageDelivery::Hosted(uploader))
                        .into_definition(),
                    RemoveBackgroundTool::definition(),
                    ChangeBackgroundTool::definition(),
                ]
            }
            ToolSet::Base64Image => {
                vec![GenerateImageTool::new(provider, ImageDelivery::Base64).into_definition()]
            }
            ToolSet::Mcp => vec![MockWeatherTool::definition()],
            ToolSet::WebSearch => {
                let search = &state.settings.search;
                vec![WebSearchTool::new(search.api_key()?)
                    .with_base_url(&search.base_url)
                    .into_definition()]
            }
        };
        Ok(ToolRegistry::new(definitions)?)
    }
}

#[derive(Debug, Clone)]
pub struct ChatEndpoint {
    pub path: &'static str,
    /// Bundled prompt used as the system prompt
    pub system: Option<&'static str>,
    pub tools: ToolSet,
    pub max_steps: usize,
    /// Cite tool sources to the client as `source-url` chunks
    pub send_sources: bool,
}

impl ChatEndpoint {
    pub const fn new(path: &'static str, tools: ToolSet, max_steps: usize) -> Self {
        Self {
            path,
            system: None,
            tools,
            max_steps,
            send_sources: false,
        }
    }

    pub const fn with_system(mut self, prompt: &'static str) -> Self {
        self.system = Some(prompt);
        self
    }

    pub const fn with_sources(mut self) -> Self {
        self.send_sources = true;
        self
    }
}

pub const ENDPOINTS: &[ChatEndpoint] = &[
    ChatEndpoint::new("/api/chat", ToolSet::None, 1).with_system("chat.md"),
    ChatEndpoint::new("/api/multi-modal-chat", ToolSet::None, 1),
    ChatEndpoint::new("/api/multi-step-tool", ToolSet::Demo, 4),
    ChatEndpoint::new("/api/weather-api", ToolSet::WeatherApi, 2),
    ChatEndpoint::new("/api/client-side-tool", ToolSet::ImageEditing, 3)
        .with_system("image_assistant.md"),
    ChatEndpoint::new("/api/gen-img-tool", ToolSet::Base64Image, 3),
    ChatEndpoint::new("/api/mcp-tools", ToolSet::Mcp, 3),
    ChatEndpoint::new("/api/web-search-tool", ToolSet::WebSearch, 3).with_sources(),
];

async fn connect_mcp(state: &AppState, registry: ToolRegistry) -> Result<(ToolRegistry, Arc<McpClient>), ApiError> {
    let client = Arc::new(McpClient::connect(state.settings.mcp.to_config()?).await?);
    match client.tool_definitions().await {
        Ok(remote) => {
            info!(tools = remote.len(), "loaded remote tools");
            Ok((registry.merged_with(remote), client))
        }
        Err(e) => {
            if let Err(close_err) = client.close().await {
                warn!("failed to close MCP session: {}", close_err);
            }
            Err(e.into())
        }
    }
}

pub async fn handle(
    state: AppState,
    endpoint: ChatEndpoint,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<SseResponse, ApiError> {
    let Json(request) = payload?;
    info!(endpoint = endpoint.path, messages = request.messages.len(), "chat request");

    let provider = state.provider()?;
    let mut registry = endpoint.tools.registry(&state, provider.clone())?;
    let mut mcp = None;
    if endpoint.tools == ToolSet::Mcp {
        let (merged, client) = connect_mcp(&state, registry).await?;
        registry = merged;
        mcp = Some(client);
    }

    let system = match endpoint.system {
        Some(name) => static_prompt(name).map_err(|e| ApiError::Internal(e.to_string()))?,
        None => String::new(),
    };
    let messages = ui_messages_to_messages(&request.messages, &registry);
    let agent = Agent::new(provider)
        .with_system(system)
        .with_tools(registry)
        .with_max_steps(endpoint.max_steps)
        .with_sources(endpoint.send_sources);

    match prime(agent.reply(messages)).await {
        Ok(events) => Ok(stream_reply(events, mcp)),
        Err(e) => {
            if let Some(mcp) = mcp {
                if let Err(close_err) = mcp.close().await {
                    warn!("failed to close MCP session: {}", close_err);
                }
            }
            Err(e.into())
        }
    }
}

pub fn routes(state: AppState) -> Router {
    let mut router = Router::new();
    for endpoint in ENDPOINTS {
        let endpoint = endpoint.clone();
        router = router.route(
            endpoint.path,
            post(
                move |State(state): State<AppState>,
                      payload: Result<Json<ChatRequest>, JsonRejection>| {
                    handle(state, endpoint.clone(), payload)
                },
            ),
        );
    }
    router.with_state(state)
}
