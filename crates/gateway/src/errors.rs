use runtime::ApprovalError;
use thiserror::Error;
use types::{ErrorKind, MemoryError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("principal `{principal_id}` may not access session `{session_id}`")]
    Forbidden {
        principal_id: String,
        session_id: String,
    },
    #[error("session `{session_id}` already has a run in flight")]
    SessionBusy { session_id: String },
    #[error("rate limit exceeded; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("session `{session_id}` not found")]
    SessionNotFound { session_id: String },
    #[error("session `{session_id}` has no active run")]
    NoActiveRun { session_id: String },
    #[error("memory is disabled")]
    MemoryDisabled,
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The run itself ended in `failed`.
    #[error("run failed ({kind}): {message}")]
    Run { kind: ErrorKind, message: String },
    #[error("internal gateway failure: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Forbidden { .. } => ErrorKind::Authorization,
            Self::SessionBusy { .. } => ErrorKind::SessionBusy,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::SessionNotFound { .. } | Self::NoActiveRun { .. } | Self::MemoryDisabled => {
                ErrorKind::NotFound
            }
            Self::Approval(error) => error.kind(),
            Self::Memory(error) => error.kind(),
            Self::Run { kind, .. } => *kind,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
