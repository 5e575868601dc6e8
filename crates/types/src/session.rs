use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ErrorKind, MemoryError, Message, MessageRole, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    AwaitingApproval,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub principal_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(session_id: impl Into<String>, principal_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            principal_id: principal_id.into(),
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Idle,
        }
    }
}

/// One ordered piece of a transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCallRequest {
        tool_call_id: String,
        name: String,
        arguments: Value,
    },
    ToolCallResult {
        tool_call_id: String,
        output: String,
        is_error: bool,
    },
    MemoryCitation {
        record_id: String,
        excerpt: String,
    },
}

/// Immutable, append-only transcript entry keyed by `(session_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub message_id: String,
    pub session_id: String,
    pub sequence: u64,
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
    pub token_count: u32,
}

impl TranscriptMessage {
    pub fn text_content(&self) -> Option<String> {
        let text = self
            .parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        (!text.is_empty()).then_some(text)
    }

    /// Converts the entry into the shape providers consume.
    pub fn to_provider_message(&self) -> Message {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut tool_call_id = None;
        for part in &self.parts {
            match part {
                ContentPart::Text { text } => content.push_str(text),
                ContentPart::ToolCallRequest {
                    tool_call_id,
                    name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    id: tool_call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                ContentPart::ToolCallResult {
                    tool_call_id: id,
                    output,
                    ..
                } => {
                    content.push_str(output);
                    tool_call_id = Some(id.clone());
                }
                ContentPart::MemoryCitation { record_id, excerpt } => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&format!("[memory {record_id}] {excerpt}"));
                }
            }
        }
        Message {
            role: self.role,
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            tool_call_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    AwaitingApproval,
    Executing,
    Succeeded,
    Failed,
    Rejected,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "executing" => Some(Self::Executing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Rejected)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, AwaitingApproval)
                | (Pending, Failed)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Rejected)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool call `{tool_call_id}` cannot move from {from} to {to}")]
pub struct InvalidToolCallTransition {
    pub tool_call_id: String,
    pub from: ToolCallStatus,
    pub to: ToolCallStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Lifecycle record of one tool invocation, owned by the message that
/// requested it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub session_id: String,
    pub message_sequence: u64,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn pending(
        session_id: impl Into<String>,
        message_sequence: u64,
        call: &ToolCall,
    ) -> Self {
        let now = Utc::now();
        Self {
            tool_call_id: call.id.clone(),
            session_id: session_id.into(),
            message_sequence,
            tool_name: call.name.clone(),
            input: call.arguments.clone(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            rejection_reason: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: ToolCallStatus) -> Result<(), InvalidToolCallTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidToolCallTransition {
                tool_call_id: self.tool_call_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn succeed(&mut self, output: String) -> Result<(), InvalidToolCallTransition> {
        self.transition(ToolCallStatus::Succeeded)?;
        self.result = Some(output);
        self.error = None;
        Ok(())
    }

    pub fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), InvalidToolCallTransition> {
        self.transition(ToolCallStatus::Failed)?;
        self.result = None;
        self.error = Some(ToolFailure {
            kind,
            message: message.into(),
        });
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), InvalidToolCallTransition> {
        self.transition(ToolCallStatus::Rejected)?;
        self.rejection_reason = Some(reason.into());
        Ok(())
    }

    /// Text handed back to the model for this call.
    pub fn model_feedback(&self) -> String {
        match self.status {
            ToolCallStatus::Succeeded => self.result.clone().unwrap_or_default(),
            ToolCallStatus::Failed => match &self.error {
                Some(error) => format!("Tool execution failed ({}): {}", error.kind, error.message),
                None => "Tool execution failed".to_owned(),
            },
            ToolCallStatus::Rejected => format!(
                "Tool call was rejected: {}",
                self.rejection_reason.as_deref().unwrap_or("no reason given")
            ),
            status => format!("Tool call did not finish (status {status})"),
        }
    }
}

/// Persisted record of a run that ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailureRecord {
    pub session_id: String,
    pub run_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Durable transcript storage.
///
/// Implemented in the `memory` crate and injected into the session
/// coordinator at startup.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, MemoryError>;

    /// Inserts or updates the session row.
    async fn save_session(&self, session: &Session) -> Result<(), MemoryError>;

    /// Appends messages and upserts tool-call rows in one transaction.
    ///
    /// Message sequences must continue the stored transcript without gaps.
    async fn append(
        &self,
        session_id: &str,
        messages: &[TranscriptMessage],
        tool_calls: &[ToolCallRecord],
    ) -> Result<(), MemoryError>;

    async fn load_transcript(&self, session_id: &str)
    -> Result<Vec<TranscriptMessage>, MemoryError>;

    async fn load_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>, MemoryError>;

    async fn record_run_failure(&self, failure: &RunFailureRecord) -> Result<(), MemoryError>;
}
