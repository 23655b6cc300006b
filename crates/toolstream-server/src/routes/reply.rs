use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{
    stream::{self, StreamExt},
    Stream,
};
use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use toolstream::{
    agent::{AgentEvent, AgentStream},
    protocol::{encode_agent_stream, sse_frame, DONE, UI_STREAM_HEADER, UI_STREAM_VERSION},
    providers::errors::ProviderError,
    tools::mcp::McpClient,
};
use tracing::{debug, info, warn};

use crate::error::describe_stream_error;

const HEARTBEAT: Duration = Duration::from_millis(500);

// Custom SSE response type that implements the AI SDK UI message stream protocol
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = Body::from_stream(self);
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            [(UI_STREAM_HEADER, UI_STREAM_VERSION)],
            body,
        )
            .into_response()
    }
}

/// Wait for the model's first output so an upstream failure can still be answered
/// with a status code instead of a stream that errors immediately.
pub async fn prime(mut events: AgentStream) -> Result<AgentStream, ProviderError> {
    let mut head = Vec::new();
    while let Some(event) = events.next().await {
        let event = event?;
        let started = event != AgentEvent::StartStep;
        head.push(Ok(event));
        if started {
            break;
        }
    }
    Ok(stream::iter(head).chain(events).boxed())
}

/// Stream a reply as UI message chunks. The producer task stops as soon as the
/// client goes away; `mcp` is closed once the reply is over either way.
pub fn stream_reply(events: AgentStream, mcp: Option<Arc<McpClient>>) -> SseResponse {
    let (tx, rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut chunks = encode_agent_stream(events, describe_stream_error);

        loop {
            match timeout(HEARTBEAT, chunks.next()).await {
                Ok(Some(chunk)) => {
                    debug!(?chunk, "sending chunk");
                    if tx.send(sse_frame(&chunk.to_json_string())).await.is_err() {
                        info!("client disconnected, cancelling reply");
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(sse_frame(DONE)).await;
                    break;
                }
                Err(_) => {
                    // Heartbeat, used to detect disconnected clients and then end running tools.
                    if tx.is_closed() {
                        info!("client disconnected, cancelling reply");
                        break;
                    }
                }
            }
        }

        // drop in-flight model calls and tool executions before releasing the session
        drop(chunks);
        if let Some(mcp) = mcp {
            if let Err(e) = mcp.close().await {
                warn!("failed to close MCP session: {}", e);
            }
        }
    });

    SseResponse::new(ReceiverStream::new(rx))
}
