use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use toolstream::{
    agent::Agent,
    models::{message::Message, role::Role, tool::ToolCall},
    protocol::{encode_agent_stream, UiChunk},
    providers::{
        errors::{ErrorKind, ProviderError},
        mock::MockProvider,
    },
    tools::{
        demo::{LocationTool, MockWeatherTool},
        image::{ChangeBackgroundTool, RemoveBackgroundTool},
        ToolHandler, ToolRegistry,
    },
    ui::{ui_messages_to_messages, ChatState, ToolState, UiMessage},
};

/// Run one server reply against `state`, the way a browser would observe it
async fn exchange(agent: &Agent, registry: &ToolRegistry, state: &mut ChatState) -> Result<()> {
    let messages = ui_messages_to_messages(&state.messages, registry);
    let mut chunks = encode_agent_stream(agent.reply(messages), |e| e.to_string());
    while let Some(chunk) = chunks.next().await {
        state.apply(chunk)?;
    }
    Ok(())
}

fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Message {
    Message::assistant().with_tool_request(id, Ok(ToolCall::new(name, arguments)))
}

#[tokio::test]
async fn test_multi_step_weather_lookup() -> Result<()> {
    let provider = MockProvider::new(vec![
        tool_call("call_1", "getLocation", json!({"input": "Minar-e-Pakistan"})),
        tool_call("call_2", "getWeather", json!({"city": "Lahore"})),
        Message::assistant().with_text("Lahore is 52 and sunny."),
    ]);
    let registry = ToolRegistry::new(vec![LocationTool::definition(), MockWeatherTool::definition()])?;
    let agent = Agent::new(Arc::new(provider.clone()))
        .with_tools(registry.clone())
        .with_max_steps(4);

    let mut state = ChatState::new(vec![UiMessage::user_text(
        "What's the weather at Minar-e-Pakistan?",
    )]);
    exchange(&agent, &registry, &mut state).await?;

    let assistant = state.messages.last().unwrap();
    assert_eq!(assistant.role, Role::Assistant);
    let outputs: Vec<_> = assistant
        .tool_invocations()
        .map(|tool| (tool.state, tool.output.clone()))
        .collect();
    assert_eq!(
        outputs,
        vec![
            (ToolState::OutputAvailable, Some(json!("Lahore"))),
            (ToolState::OutputAvailable, Some(json!("52 and sunny"))),
        ]
    );
    assert_eq!(assistant.text(), "Lahore is 52 and sunny.");
    assert_eq!(provider.requests().len(), 3);
    assert!(!state.should_resubmit());
    Ok(())
}

#[tokio::test]
async fn test_step_cap_leaves_last_call_answered() -> Result<()> {
    let provider = MockProvider::new(
        (0..5)
            .map(|i| tool_call(&format!("call_{}", i), "getWeather", json!({"city": "Karachi"})))
            .collect(),
    );
    let registry = ToolRegistry::new(vec![MockWeatherTool::definition()])?;
    let agent = Agent::new(Arc::new(provider.clone()))
        .with_tools(registry.clone())
        .with_max_steps(2);

    let mut state = ChatState::new(vec![UiMessage::user_text("weather?")]);
    exchange(&agent, &registry, &mut state).await?;

    assert_eq!(provider.requests().len(), 2);
    let assistant = state.messages.last().unwrap();
    assert_eq!(assistant.tool_invocations().count(), 2);
    assert!(assistant
        .tool_invocations()
        .all(|tool| tool.state == ToolState::OutputAvailable));
    Ok(())
}

#[tokio::test]
async fn test_unknown_city_and_bad_arguments() -> Result<()> {
    let provider = MockProvider::new(vec![
        Message::assistant()
            .with_tool_request("call_1", Ok(ToolCall::new("getWeather", json!({"city": "Unknown"}))))
            .with_tool_request("call_2", Ok(ToolCall::new("getWeather", json!({"town": "Lahore"}))))
            .with_tool_request("call_3", Ok(ToolCall::new("getForecast", json!({})))),
        Message::assistant().with_text("Sorry."),
    ]);
    let registry = ToolRegistry::new(vec![MockWeatherTool::definition()])?;
    let agent = Agent::new(Arc::new(provider))
        .with_tools(registry.clone())
        .with_max_steps(2);

    let mut state = ChatState::new(vec![UiMessage::user_text("weather?")]);
    exchange(&agent, &registry, &mut state).await?;

    let tools: Vec<_> = state.messages[1].tool_invocations().cloned().collect();
    assert_eq!(tools[0].state, ToolState::OutputAvailable);
    assert_eq!(tools[0].output, Some(json!("Unknown City")));
    assert_eq!(tools[1].state, ToolState::OutputError);
    assert_eq!(tools[2].state, ToolState::OutputError);
    assert!(tools[2].error_text.as_deref().unwrap_or_default().contains("getForecast"));
    Ok(())
}

#[tokio::test]
async fn test_client_tool_round_trip() -> Result<()> {
    let provider = MockProvider::new(vec![
        tool_call(
            "call_bg",
            "changeBackground",
            json!({"imageUrl": "https://ik.imagekit.io/demo/toy.jpg", "backgroundPrompt": "beach"}),
        ),
        Message::assistant().with_text("Here is your toy on the beach."),
    ]);
    let registry = ToolRegistry::new(vec![
        RemoveBackgroundTool::definition(),
        ChangeBackgroundTool::definition(),
    ])?;
    let agent = Agent::new(Arc::new(provider.clone()))
        .with_tools(registry.clone())
        .with_max_steps(3);

    let mut state = ChatState::new(vec![UiMessage::user_text("put the toy image on a beach")]);
    exchange(&agent, &registry, &mut state).await?;

    // the server stops and leaves the call for the browser
    assert_eq!(provider.requests().len(), 1);
    let pending = state.pending_client_tool_calls();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, ToolState::InputAvailable);

    let input = pending[0].input.clone().unwrap_or_default();
    let result = ChangeBackgroundTool.call(input).await;
    state.add_tool_result(&pending[0].tool_call_id, result)?;
    assert!(state.should_resubmit());

    exchange(&agent, &registry, &mut state).await?;
    assert_eq!(state.messages.len(), 2);
    let assistant = &state.messages[1];
    assert_eq!(assistant.text(), "Here is your toy on the beach.");

    // the continuation request carries the browser's result
    let requests = provider.requests();
    let resubmitted = format!("{:?}", requests[1].messages);
    assert!(resubmitted.contains("https://ik.imagekit.io/demo/toy.jpg?tr=e-changebg-prompt-beach"));
    Ok(())
}

#[tokio::test]
async fn test_provider_failure_ends_with_error_chunk() -> Result<()> {
    let provider = MockProvider::with_results(vec![Err(ProviderError::new(
        ErrorKind::RateLimited,
        "quota exceeded",
    ))]);
    let agent = Agent::new(Arc::new(provider));

    let chunks: Vec<UiChunk> =
        encode_agent_stream(agent.reply(vec![Message::user().with_text("hi")]), |e| {
            format!("{} ({})", e.message, e.kind.status_code())
        })
        .collect()
        .await;

    assert!(matches!(chunks.first(), Some(UiChunk::Start { .. })));
    assert_eq!(
        chunks[chunks.len() - 2],
        UiChunk::Error {
            error_text: "quota exceeded (429)".into()
        }
    );
    assert_eq!(chunks.last(), Some(&UiChunk::Finish));
    Ok(())
}
