use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ModelId, ProviderId};

/// Failure classification shared by every layer.
///
/// The kind decides retry behaviour and how a failure is surfaced to a
/// client; the concrete error enums below map onto it via `kind()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    RateLimited,
    TransientExternal,
    FatalExternal,
    Timeout,
    Cancelled,
    Internal,
    SessionBusy,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::RateLimited => "rate_limited",
            Self::TransientExternal => "transient_external",
            Self::FatalExternal => "fatal_external",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
            Self::SessionBusy => "session_busy",
            Self::NotFound => "not_found",
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::TransientExternal | Self::Timeout | Self::SessionBusy
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown model id `{model}` for provider `{provider}`")]
    UnknownModel {
        provider: ProviderId,
        model: ModelId,
    },
    #[error("missing API key for provider `{provider}`")]
    MissingApiKey { provider: ProviderId },
    #[error("provider transport failed for `{provider}`: {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    #[error("provider `{provider}` returned HTTP {status}: {message}")]
    HttpStatus {
        provider: ProviderId,
        status: u16,
        message: String,
    },
    #[error("provider response parsing failed for `{provider}`: {message}")]
    ResponseParse {
        provider: ProviderId,
        message: String,
    },
    #[error("provider request failed for {provider}: {message}")]
    RequestFailed {
        provider: ProviderId,
        message: String,
    },
    #[error("provider `{provider}` stream was interrupted: {message}")]
    StreamInterrupted {
        provider: ProviderId,
        message: String,
    },
    #[error("provider serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::StreamInterrupted { .. } => ErrorKind::TransientExternal,
            Self::HttpStatus { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::TransientExternal
            }
            Self::HttpStatus { status, .. } if *status == 408 => ErrorKind::Timeout,
            Self::HttpStatus { .. }
            | Self::MissingApiKey { .. }
            | Self::ResponseParse { .. }
            | Self::RequestFailed { .. } => ErrorKind::FatalExternal,
            Self::UnknownModel { .. } => ErrorKind::Validation,
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{tool}`")]
    UnknownTool { tool: String },
    #[error("invalid arguments for tool {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed for {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("tool {tool} hit a transient failure: {message}")]
    Transient { tool: String, message: String },
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("tool {tool} is rate limited; retry after {retry_after_ms}ms")]
    RateLimited { tool: String, retry_after_ms: u64 },
    #[error("tool serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool { .. } | Self::InvalidArguments { .. } => ErrorKind::Validation,
            Self::ExecutionFailed { .. } => ErrorKind::FatalExternal,
            Self::Transient { .. } => ErrorKind::TransientExternal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures are retried with backoff; everything else is final.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory connection failed: {message}")]
    Connection { message: String },
    #[error("memory initialization failed: {message}")]
    Initialization { message: String },
    #[error("memory migration failed: {message}")]
    Migration { message: String },
    #[error("memory query failed: {message}")]
    Query { message: String },
    #[error("memory embedding failed: {message}")]
    Embedding { message: String },
    #[error("transcript sequence {sequence} for session `{session_id}` must follow {expected}")]
    SequenceGap {
        session_id: String,
        sequence: u64,
        expected: u64,
    },
    #[error("memory serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("memory item not found for session `{session_id}`")]
    NotFound { session_id: String },
    #[error("memory writes rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Connection { .. } => ErrorKind::TransientExternal,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("run cancelled")]
    Cancelled,
    #[error("run exceeded its step budget of {max_steps}")]
    StepBudgetExceeded { max_steps: usize },
    #[error("run exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("model call timed out after {timeout_ms}ms")]
    ModelTimeout { timeout_ms: u64 },
    #[error("internal runtime failure: {message}")]
    Internal { message: String },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(error) => error.kind(),
            Self::Tool(error) => error.kind(),
            Self::Memory(error) => error.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StepBudgetExceeded { .. }
            | Self::DeadlineExceeded { .. }
            | Self::ModelTimeout { .. } => ErrorKind::Timeout,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}
