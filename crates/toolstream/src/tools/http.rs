use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

use crate::errors::AgentError;

/// Per-attempt timeout and retry budget for calls to auxiliary services
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retries: 1,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Send `request`, retrying on timeouts, connection failures and gateway errors.
/// The last response is returned whatever its status; callers decide what a
/// non-success status means. Requests with streaming bodies cannot be cloned and
/// are sent once.
pub async fn send_with_retry(
    request: RequestBuilder,
    policy: RetryPolicy,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0;
    let mut pending = request;
    loop {
        let retry = if attempt < policy.retries {
            pending.try_clone()
        } else {
            None
        };

        let result = pending.timeout(policy.timeout).send().await;
        let next = match (&result, retry) {
            (Ok(response), Some(next)) if is_transient_status(response.status()) => {
                warn!(status = %response.status(), attempt, "transient status, retrying");
                next
            }
            (Err(err), Some(next)) if is_transient_error(err) => {
                warn!(attempt, "transient failure, retrying: {}", err);
                next
            }
            _ => return result,
        };

        tokio::time::sleep(policy.backoff).await;
        attempt += 1;
        pending = next;
    }
}

/// Map a transport failure to the error reported on the tool call
pub fn tool_error(service: &str, err: reqwest::Error) -> AgentError {
    if err.is_timeout() || err.is_connect() {
        AgentError::Timeout(format!("{}: {}", service, err))
    } else {
        AgentError::ExecutionError(format!("{}: {}", service, err))
    }
}
