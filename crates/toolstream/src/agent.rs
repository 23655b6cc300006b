use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::models::message::Message;
use crate::models::tool::ToolCall;
use crate::providers::base::{CompletionRequest, FinishReason, Provider, ProviderEvent, Usage};
use crate::providers::errors::ProviderError;
use crate::providers::utils::parse_tool_call;
use crate::tools::ToolRegistry;

/// Upper bound used when an endpoint does not set its own step cap
pub const DEFAULT_MAX_STEPS: usize = 1;

/// What happened during a reply, in the order it happened. Every tool call goes
/// through `ToolInputStart`, `ToolInputAvailable` and, unless it is a client-side
/// tool, exactly one of `ToolOutputAvailable` / `ToolOutputError`.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StartStep,
    TextDelta(String),
    ToolInputStart {
        id: String,
        name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputAvailable {
        id: String,
        name: String,
        input: Value,
    },
    ToolOutputAvailable {
        id: String,
        output: Value,
    },
    ToolOutputError {
        id: String,
        error_text: String,
    },
    Source {
        id: String,
        url: String,
        title: Option<String>,
    },
    FinishStep {
        reason: FinishReason,
        usage: Usage,
    },
}

pub type AgentStream = BoxStream<'static, Result<AgentEvent, ProviderError>>;

struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// How a resolved call proceeds after its input is complete
enum Resolution {
    Execute(ToolCall),
    Client,
    Failed(AgentError),
}

/// Agent drives a multi-step conversation: each step is one model call, and tool
/// results feed the next step until the model stops calling tools, a call needs
/// the client, or `max_steps` is reached.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    system: String,
    max_steps: usize,
    send_sources: bool,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            registry: ToolRegistry::empty(),
            system: String::new(),
            max_steps: DEFAULT_MAX_STEPS,
            send_sources: false,
        }
    }

    pub fn with_tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_system<S: Into<String>>(mut self, system: S) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Emit the sources cited by tool outputs as `Source` events
    pub fn with_sources(mut self, send_sources: bool) -> Self {
        self.send_sources = send_sources;
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    fn resolve(&self, call: &PendingCall) -> (Value, Resolution) {
        let parsed = match parse_tool_call(&call.id, &call.name, &call.arguments) {
            Ok(parsed) => parsed,
            Err(e) => return (Value::String(call.arguments.clone()), Resolution::Failed(e)),
        };
        let input = parsed.arguments.clone();

        let Some(definition) = self.registry.get(&parsed.name) else {
            return (input, Resolution::Failed(AgentError::ToolNotFound(parsed.name)));
        };
        if let Err(e) = definition.validate(&parsed.arguments) {
            return (input, Resolution::Failed(e));
        }
        if definition.is_client_side() {
            (input, Resolution::Client)
        } else {
            (input, Resolution::Execute(parsed))
        }
    }

    async fn dispatch_tool_call(&self, call: ToolCall) -> AgentResult<Value> {
        let handler = self
            .registry
            .get(&call.name)
            .and_then(|definition| definition.handler.clone())
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;
        handler.call(call.arguments).await
    }

    /// Stream the reply to `messages`. Dropping the stream cancels the model call
    /// and any tool executions in flight.
    pub fn reply(&self, messages: Vec<Message>) -> AgentStream {
        let agent = self.clone();
        let tools = agent.registry.tools();

        Box::pin(async_stream::try_stream! {
            let mut messages = messages;

            for step in 0..agent.max_steps {
                debug!(step, "starting step");
                yield AgentEvent::StartStep;

                let request = CompletionRequest::new(agent.system.clone(), messages.clone())
                    .with_tools(tools.clone());
                let mut events = agent.provider.stream(&request).await?;

                let mut text = String::new();
                let mut calls: BTreeMap<usize, PendingCall> = BTreeMap::new();
                let mut finish = (FinishReason::Stop, Usage::default());

                while let Some(event) = events.next().await {
                    match event? {
                        ProviderEvent::TextDelta(delta) => {
                            text.push_str(&delta);
                            yield AgentEvent::TextDelta(delta);
                        }
                        ProviderEvent::ToolCallStart { index, id, name } => {
                            calls.insert(index, PendingCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: String::new(),
                            });
                            yield AgentEvent::ToolInputStart { id, name };
                        }
                        ProviderEvent::ToolCallDelta { index, arguments } => {
                            if let Some(call) = calls.get_mut(&index) {
                                call.arguments.push_str(&arguments);
                                yield AgentEvent::ToolInputDelta {
                                    id: call.id.clone(),
                                    delta: arguments,
                                };
                            } else {
                                warn!(index, "argument delta for unknown tool call");
                            }
                        }
                        ProviderEvent::Finish { reason, usage } => {
                            finish = (reason, usage);
                        }
                    }
                }

                let mut assistant = Message::assistant();
                if !text.is_empty() {
                    assistant = assistant.with_text(text);
                }
                let mut tool_results = Message::user();
                let mut executions = Vec::new();
                let mut needs_client = false;

                for call in calls.values() {
                    let (input, resolution) = agent.resolve(call);
                    yield AgentEvent::ToolInputAvailable {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: input.clone(),
                    };

                    match resolution {
                        Resolution::Execute(tool_call) => {
                            assistant = assistant.with_tool_request(&call.id, Ok(tool_call.clone()));
                            executions.push((call.id.clone(), tool_call));
                        }
                        Resolution::Client => {
                            needs_client = true;
                            assistant = assistant.with_tool_request(
                                &call.id,
                                Ok(ToolCall::new(&call.name, input)),
                            );
                        }
                        Resolution::Failed(error) => {
                            warn!(tool = %call.name, "tool call rejected: {}", error);
                            let arguments = if input.is_object() { input } else { json!({}) };
                            assistant = assistant.with_tool_request(
                                &call.id,
                                Ok(ToolCall::new(&call.name, arguments)),
                            );
                            yield AgentEvent::ToolOutputError {
                                id: call.id.clone(),
                                error_text: error.to_string(),
                            };
                            tool_results = tool_results.with_tool_response(&call.id, Err(error));
                        }
                    }
                }

                // Run the server-side calls in parallel and wait for all of them
                let outputs = futures::future::join_all(
                    executions
                        .iter()
                        .map(|(_, call)| agent.dispatch_tool_call(call.clone())),
                )
                .await;

                for ((id, call), output) in executions.into_iter().zip(outputs) {
                    match output {
                        Ok(output) => {
                            info!(tool = %call.name, "tool call succeeded");
                            let definition = agent.registry.get(&call.name);
                            let model_output = definition
                                .map(|definition| definition.model_output(&output))
                                .unwrap_or_else(|| output.clone());
                            let sources = match definition {
                                Some(definition) if agent.send_sources => definition.sources(&output),
                                _ => Vec::new(),
                            };
                            yield AgentEvent::ToolOutputAvailable {
                                id: id.clone(),
                                output,
                            };
                            for source in sources {
                                yield AgentEvent::Source {
                                    id: source.id,
                                    url: source.url,
                                    title: source.title,
                                };
                            }
                            tool_results = tool_results.with_tool_response(id, Ok(model_output));
                        }
                        Err(error) => {
                            warn!(tool = %call.name, "tool call failed: {}", error);
                            yield AgentEvent::ToolOutputError {
                                id: id.clone(),
                                error_text: error.to_string(),
                            };
                            tool_results = tool_results.with_tool_response(id, Err(error));
                        }
                    }
                }

                let (reason, usage) = finish;
                yield AgentEvent::FinishStep { reason, usage };

                let had_calls = !calls.is_empty();
                messages.push(assistant);
                if !tool_results.is_empty() {
                    messages.push(tool_results);
                }

                if !had_calls {
                    break;
                }
                if needs_client {
                    info!(step, "waiting for client-side tool results");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::MessageContent;
    use crate::models::tool::Tool;
    use crate::providers::mock::MockProvider;
    use crate::tools::demo::MockWeatherTool;
    use crate::tools::{ToolDefinition, ToolHandler};
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::TryStreamExt;

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _arguments: Value) -> AgentResult<Value> {
            Err(AgentError::ExecutionError("service down".into()))
        }
    }

    fn weather_call(id: &str, city: &str) -> Message {
        Message::assistant().with_tool_request(
            id,
            Ok(ToolCall::new("getWeather", json!({"city": city}))),
        )
    }

    async fn collect(agent: &Agent, messages: Vec<Message>) -> Result<Vec<AgentEvent>> {
        Ok(agent.reply(messages).try_collect().await?)
    }

    #[tokio::test]
    async fn test_simple_response() -> Result<()> {
        let response = Message::assistant().with_text("Hello!");
        let provider = MockProvider::new(vec![response]);
        let agent = Agent::new(Arc::new(provider));

        let events = collect(&agent, vec![Message::user().with_text("Hi")]).await?;
        assert_eq!(
            events,
            vec![
                AgentEvent::StartStep,
                AgentEvent::TextDelta("Hello!".into()),
                AgentEvent::FinishStep {
                    reason: FinishReason::Stop,
                    usage: Usage::default()
                },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_round_trip() -> Result<()> {
        let provider = MockProvider::new(vec![
            weather_call("call_1", "Karachi"),
            Message::assistant().with_text("It is 52 and sunny in Karachi."),
        ]);
        let registry = ToolRegistry::new(vec![MockWeatherTool::definition()])?;
        let agent = Agent::new(Arc::new(provider.clone()))
            .with_tools(registry)
            .with_max_steps(4);

        let events = collect(&agent, vec![Message::user().with_text("Weather?")]).await?;

        assert!(events.contains(&AgentEvent::ToolOutputAvailable {
            id: "call_1".into(),
            output: json!("52 and sunny"),
        }));
        assert_eq!(
            events.iter().filter(|e| **e == AgentEvent::StartStep).count(),
            2
        );

        // the second request carries the tool result back to the model
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        if let MessageContent::ToolResponse(response) = &last.content[0] {
            assert_eq!(response.tool_result, Ok(json!("52 and sunny")));
        } else {
            panic!("Expected ToolResponse content");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_step_cap_bounds_model_calls() -> Result<()> {
        let provider = MockProvider::new(
            (0..10)
                .map(|i| weather_call(&format!("call_{}", i), "Lahore"))
                .collect(),
        );
        let registry = ToolRegistry::new(vec![MockWeatherTool::definition()])?;
        let agent = Agent::new(Arc::new(provider.clone()))
            .with_tools(registry)
            .with_max_steps(3);

        let events = collect(&agent, vec![Message::user().with_text("loop")]).await?;
        assert_eq!(provider.requests().len(), 3);
        let outputs = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolOutputAvailable { .. }))
            .count();
        assert_eq!(outputs, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_tool_stops_without_output() -> Result<()> {
        let provider = MockProvider::new(vec![Message::assistant().with_tool_request(
            "call_bg",
            Ok(ToolCall::new("removeBackground", json!({"imageUrl": "https://cdn/a.png"}))),
        )]);
        let registry = ToolRegistry::new(vec![ToolDefinition::client(Tool::new(
            "removeBackground",
            "remove background",
            json!({"type": "object", "properties": {"imageUrl": {"type": "string"}}}),
        ))])?;
        let agent = Agent::new(Arc::new(provider.clone()))
            .with_tools(registry)
            .with_max_steps(3);

        let events = collect(&agent, vec![Message::user().with_text("remove it")]).await?;
        assert_eq!(provider.requests().len(), 1);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolInputAvailable { id, .. } if id == "call_bg")));
        assert!(!events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolOutputAvailable { .. } | AgentEvent::ToolOutputError { .. }
        )));
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_failures_become_output_errors() -> Result<()> {
        let provider = MockProvider::new(vec![
            Message::assistant()
                .with_tool_request("call_a", Ok(ToolCall::new("flaky", json!({}))))
                .with_tool_request("call_b", Ok(ToolCall::new("missing", json!({}))))
                .with_tool_request("call_c", Ok(ToolCall::new("getWeather", json!({"town": "x"})))),
            Message::assistant().with_text("Sorry."),
        ]);
        let registry = ToolRegistry::new(vec![
            MockWeatherTool::definition(),
            ToolDefinition::server(Tool::new("flaky", "fails", json!({"type": "object"})), Failing),
        ])?;
        let agent = Agent::new(Arc::new(provider))
            .with_tools(registry)
            .with_max_steps(2);

        let events = collect(&agent, vec![Message::user().with_text("go")]).await?;
        let errors: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolOutputError { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 3);
        for id in ["call_a", "call_b", "call_c"] {
            assert!(errors.contains(&id), "{}", id);
        }
        assert_eq!(events.last(), Some(&AgentEvent::FinishStep {
            reason: FinishReason::Stop,
            usage: Usage::default()
        }));
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_error_ends_stream() {
        let provider = MockProvider::with_results(vec![Err(ProviderError::from_message(
            "You exceeded your current quota",
        ))]);
        let agent = Agent::new(Arc::new(provider));

        let result: Result<Vec<AgentEvent>, ProviderError> = agent
            .reply(vec![Message::user().with_text("hi")])
            .try_collect()
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind.status_code(), 429);
    }

    struct Cited;

    #[async_trait]
    impl ToolHandler for Cited {
        async fn call(&self, _arguments: Value) -> AgentResult<Value> {
            Ok(json!({"url": "https://example.com/a"}))
        }

        fn sources(&self, output: &Value) -> Vec<crate::tools::Source> {
            vec![crate::tools::Source {
                id: "src_1".into(),
                url: output["url"].as_str().unwrap_or_default().to_string(),
                title: None,
            }]
        }
    }

    #[tokio::test]
    async fn test_sources_follow_tool_output_when_enabled() -> Result<()> {
        let script = || {
            MockProvider::new(vec![
                Message::assistant()
                    .with_tool_request("call_1", Ok(ToolCall::new("lookup", json!({})))),
                Message::assistant().with_text("done"),
            ])
        };
        let registry = ToolRegistry::new(vec![ToolDefinition::server(
            Tool::new("lookup", "Look something up", json!({"type": "object"})),
            Cited,
        )])?;

        let agent = Agent::new(Arc::new(script()))
            .with_tools(registry.clone())
            .with_max_steps(2)
            .with_sources(true);
        let events = collect(&agent, vec![Message::user().with_text("find")]).await?;
        let output_at = events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolOutputAvailable { .. }))
            .unwrap();
        assert_eq!(
            events[output_at + 1],
            AgentEvent::Source {
                id: "src_1".into(),
                url: "https://example.com/a".into(),
                title: None,
            }
        );

        let agent = Agent::new(Arc::new(script()))
            .with_tools(registry)
            .with_max_steps(2);
        let events = collect(&agent, vec![Message::user().with_text("find")]).await?;
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Source { .. })));
        Ok(())
    }
}
