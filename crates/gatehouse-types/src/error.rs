use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of gateway failure kinds. Every failure path in the dispatch
/// engine produces exactly one of these; the HTTP surfaces decide how each
/// is rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    InvalidRequest,
    Timeout,
    QueueTimeout,
    QueueFull,
    RateLimit,
    UpstreamAuth,
    CliError,
    CliNotFound,
    Memory,
    SessionNotFound,
    SessionLimit,
    TaskNotFound,
    InvalidModel,
    StreamingNotSupported,
    Internal,
}

impl ErrorKind {
    /// Canonical HTTP status for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Auth | ErrorKind::UpstreamAuth => 401,
            ErrorKind::InvalidRequest
            | ErrorKind::InvalidModel
            | ErrorKind::StreamingNotSupported => 400,
            ErrorKind::SessionNotFound | ErrorKind::TaskNotFound => 404,
            ErrorKind::QueueFull | ErrorKind::RateLimit | ErrorKind::SessionLimit => 429,
            ErrorKind::Timeout | ErrorKind::QueueTimeout => 504,
            ErrorKind::CliError
            | ErrorKind::CliNotFound
            | ErrorKind::Memory
            | ErrorKind::Internal => 500,
        }
    }

    /// Stable machine code used in wire envelopes and logs.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::UpstreamAuth => "upstream_auth",
            ErrorKind::CliError => "cli_error",
            ErrorKind::CliNotFound => "cli_not_found",
            ErrorKind::Memory => "memory",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionLimit => "session_limit",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::StreamingNotSupported => "streaming_not_supported",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Value-typed gateway error. Carries everything a surface needs to render
/// a response without re-classifying the failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {}", .kind.code(), .message)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether the retry loop may re-attempt after this error. Only transient
    /// kinds qualify; everything else fails the submission immediately. A
    /// transport-level reset is treated as transient even when it reaches us
    /// wrapped in a CLI error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::RateLimit)
            || is_transport_reset(&self.message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn queue_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueTimeout, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn upstream_auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamAuth, message)
    }

    pub fn cli(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CliError, message)
    }

    pub fn cli_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CliNotFound, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Memory, message)
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorKind::SessionNotFound, "session not found")
    }

    pub fn session_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionLimit, message)
    }

    pub fn task_not_found() -> Self {
        Self::new(ErrorKind::TaskNotFound, "task not found")
    }

    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidModel, message)
    }

    pub fn streaming_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StreamingNotSupported, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Cooperative-cancellation outcome: the submission was aborted before a
    /// result could be produced.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::CliError, "request aborted (client_disconnect)")
    }
}

/// Message-level predicate for resets that surface without a kinded error.
fn is_transport_reset(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("connection reset")
        || lowered.contains("econnreset")
        || lowered.contains("broken pipe")
}
