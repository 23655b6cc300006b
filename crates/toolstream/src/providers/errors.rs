use strum_macros::Display;
use thiserror::Error;

/// Coarse classification of an upstream failure, decided once at the adapter boundary
/// so that handlers can map it to a status code without looking at the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    ContextLengthExceeded,
    Unsupported,
    Other,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "resource_exhausted",
    "too many requests",
    "exceeded",
];

const TIMEOUT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "cannot connect",
    "connection refused",
    "connection reset",
    "failed after",
    "fetch image from url",
    "econnrefused",
    "econnreset",
    "enotfound",
];

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            408 | 504 => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        }
    }

    /// Classify from free text. Only used when the upstream gives nothing more
    /// structured, e.g. an error object inside a successful response or a stream event.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if lowered.contains("context_length_exceeded") || lowered.contains("context length") {
            ErrorKind::ContextLengthExceeded
        } else if RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
            ErrorKind::RateLimited
        } else if TIMEOUT_MARKERS.iter().any(|m| lowered.contains(m)) {
            ErrorKind::Timeout
        } else {
            ErrorKind::Other
        }
    }

    /// HTTP status surfaced to the browser for this kind of failure
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::RateLimited => 429,
            ErrorKind::Timeout => 504,
            _ => 500,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_message<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            ErrorKind::Unsupported,
            format!("{} is not supported by this provider", operation),
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            ErrorKind::Timeout
        } else if let Some(status) = err.status() {
            ErrorKind::from_status(status.as_u16())
        } else {
            ErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Other, format!("Invalid provider payload: {}", err))
    }
}
