use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorKind, ModelId, ToolCallStatus, UsageUpdate};

pub const SUBSCRIBER_LAGGED_CODE: &str = "subscriber_lagged";
pub const CURSOR_EXPIRED_CODE: &str = "cursor_expired";

/// Incremental output of one run as produced by the executor.
///
/// The broadcaster wraps each payload in a [`StreamEvent`] carrying its
/// cursor. `Final` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamPayload {
    #[serde(rename_all = "camelCase")]
    Started { session_id: String, run_id: String },
    #[serde(rename_all = "camelCase")]
    TextDelta { delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        name: String,
        arguments: Value,
        status: ToolCallStatus,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Citation {
        record_id: String,
        excerpt: String,
        score: f64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    #[serde(rename_all = "camelCase")]
    Final {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        usage: UsageUpdate,
        model: ModelId,
    },
}

impl StreamPayload {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            code: kind.as_str().to_owned(),
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// Wire name of the event, as used for the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Citation { .. } => "citation",
            Self::Error { .. } => "error",
            Self::Final { .. } => "final",
        }
    }
}

/// A payload stamped with its position in the run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub cursor: u64,
    pub run_id: String,
    #[serde(flatten)]
    pub payload: StreamPayload,
}
