use thiserror::Error;

use crate::app::error::AppError;

/// Failure reported by the automation server or the HTTP layer under it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebDriverError {
    #[error("no such element: {0}")]
    NoSuchElement(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid session id: {0}")]
    InvalidSession(String),
    #[error("session not created: {0}")]
    SessionNotCreated(String),
    #[error("stale element reference: {0}")]
    StaleElement(String),
    #[error("server disconnected: {0}")]
    Disconnected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{error}: {message}")]
    Protocol { error: String, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

pub type WebDriverResult<T> = Result<T, WebDriverError>;

const TERMINATION_SIGNATURES: [&str; 3] = [
    "session is either terminated or not started",
    "instrumentation process is not running",
    "no such session",
];

impl WebDriverError {
    /// Maps the W3C `value.error` code onto a variant.
    pub fn from_w3c(error: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match error {
            "no such element" => WebDriverError::NoSuchElement(message),
            "timeout" | "script timeout" => WebDriverError::Timeout(message),
            "invalid session id" => WebDriverError::InvalidSession(message),
            "session not created" => WebDriverError::SessionNotCreated(message),
            "stale element reference" => WebDriverError::StaleElement(message),
            other => WebDriverError::Protocol {
                error: other.to_string(),
                message,
            },
        }
    }

    pub fn code(&self) -> &str {
        match self {
            WebDriverError::NoSuchElement(_) => "no such element",
            WebDriverError::Timeout(_) => "timeout",
            WebDriverError::InvalidSession(_) => "invalid session id",
            WebDriverError::SessionNotCreated(_) => "session not created",
            WebDriverError::StaleElement(_) => "stale element reference",
            WebDriverError::Disconnected(_) => "disconnected",
            WebDriverError::Transport(_) => "transport",
            WebDriverError::Protocol { error, .. } => error,
            WebDriverError::Decode(_) => "decode",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WebDriverError::NoSuchElement(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WebDriverError::Timeout(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, WebDriverError::StaleElement(_))
    }

    /// Typed termination variants, or a server-reported `unknown error` whose message
    /// names a dead session or a crashed instrumentation process.
    pub fn is_session_terminated(&self) -> bool {
        match self {
            WebDriverError::InvalidSession(_)
            | WebDriverError::SessionNotCreated(_)
            | WebDriverError::Disconnected(_) => true,
            WebDriverError::Protocol { error, message } if error == "unknown error" => {
                let message = message.to_lowercase();
                TERMINATION_SIGNATURES
                    .iter()
                    .any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }

    pub fn into_app_error(self, trace_id: &str) -> AppError {
        if self.is_session_terminated() {
            AppError::session(self.to_string(), trace_id)
        } else {
            AppError::dependency(self.to_string(), trace_id)
        }
    }
}

impl From<reqwest::Error> for WebDriverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebDriverError::Timeout(err.to_string())
        } else if err.is_connect() {
            WebDriverError::Disconnected(err.to_string())
        } else if err.is_decode() {
            WebDriverError::Decode(err.to_string())
        } else {
            WebDriverError::Transport(err.to_string())
        }
    }
}
