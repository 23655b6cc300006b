use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Malformed event stream: {0}")]
pub struct SseError(pub String);

pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, SseError>> + Send>>;

/// Decode a byte stream (usually a reqwest body) into server-sent events
pub fn parse_sse_stream<S, E>(byte_stream: S) -> SseStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let event_stream = byte_stream
        .map(|result| result.map_err(|e| std::io::Error::other(e.to_string())))
        .eventsource()
        .map(|result| {
            result
                .map(|event| SseEvent {
                    event_type: if event.event.is_empty() || event.event == "message" {
                        None
                    } else {
                        Some(event.event)
                    },
                    data: event.data,
                    id: if event.id.is_empty() {
                        None
                    } else {
                        Some(event.id)
                    },
                })
                .map_err(|e| SseError(e.to_string()))
        });

    Box::pin(event_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_parse_simple_sse_event() {
        let sse_data = "event: message\ndata: {\"text\": \"hello\"}\n\n";
        let byte_stream =
            stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(sse_data)) });

        let mut sse_stream = parse_sse_stream(byte_stream);

        let event = sse_stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, None);
        assert_eq!(event.data, "{\"text\": \"hello\"}");
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from("data: {\"type\":\"te")),
            Ok(Bytes::from("xt-delta\"}\n\ndata: [DONE]\n\n")),
        ];
        let mut sse_stream = parse_sse_stream(stream::iter(chunks));

        let first = sse_stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, "{\"type\":\"text-delta\"}");
        let second = sse_stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, "[DONE]");
        assert!(sse_stream.next().await.is_none());
    }
}
