use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use types::{FunctionDecl, MemoryError, MemoryRecord, SafetyTier, Tool, ToolContext, ToolError};

use crate::{execution_failed, invalid_args, parse_args, transient};

pub const MEMORY_WRITE_TOOL_NAME: &str = "memory_write";

const MEMORY_CONTENT_MAX_CHARS: usize = 2_000;
const MEMORY_CATEGORY_MAX_CHARS: usize = 64;

/// Write side of long-term memory: persists a record for a principal and
/// invalidates whatever retrievals were cached for it.
#[async_trait]
pub trait MemoryWriter: Send + Sync {
    async fn remember(
        &self,
        principal_id: &str,
        content: &str,
        category: Option<&str>,
    ) -> Result<MemoryRecord, MemoryError>;
}

#[derive(Debug, Deserialize)]
struct MemoryWriteArgs {
    content: String,
    category: Option<String>,
}

/// Lets the model save a durable fact about the current principal.
pub struct MemoryWriteTool {
    writer: Arc<dyn MemoryWriter>,
}

impl MemoryWriteTool {
    pub fn new(writer: Arc<dyn MemoryWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new(
            MEMORY_WRITE_TOOL_NAME,
            Some(
                "Save a durable fact or preference about the user, such as a preferred airline \
                 or seat. Saved facts are recalled in later conversations."
                    .to_owned(),
            ),
            json!({
                "type": "object",
                "required": ["content"],
                "additionalProperties": false,
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "The fact to remember, as a standalone sentence",
                        "minLength": 1,
                        "maxLength": MEMORY_CONTENT_MAX_CHARS
                    },
                    "category": {
                        "type": "string",
                        "description": "Optional category tag such as `preference` or `profile`",
                        "minLength": 1,
                        "maxLength": MEMORY_CATEGORY_MAX_CHARS
                    }
                }
            }),
        )
    }

    async fn execute(&self, args: &str, context: &ToolContext) -> Result<String, ToolError> {
        let request: MemoryWriteArgs = parse_args(MEMORY_WRITE_TOOL_NAME, args)?;
        let content = request.content.trim();
        if content.is_empty() {
            return Err(invalid_args(
                MEMORY_WRITE_TOOL_NAME,
                "content must not be blank",
            ));
        }
        let category = request
            .category
            .as_deref()
            .map(str::trim)
            .filter(|category| !category.is_empty());

        tracing::debug!(
            tool = MEMORY_WRITE_TOOL_NAME,
            principal_id = %context.principal_id,
            category = ?category,
            "writing memory record"
        );
        let record = self
            .writer
            .remember(&context.principal_id, content, category)
            .await
            .map_err(|error| match error {
                MemoryError::RateLimited { retry_after_ms } => ToolError::RateLimited {
                    tool: MEMORY_WRITE_TOOL_NAME.to_owned(),
                    retry_after_ms,
                },
                MemoryError::Connection { .. } => transient(
                    MEMORY_WRITE_TOOL_NAME,
                    format!("memory store unavailable: {error}"),
                ),
                other => execution_failed(
                    MEMORY_WRITE_TOOL_NAME,
                    format!("memory write failed: {other}"),
                ),
            })?;

        Ok(json!({
            "stored": true,
            "record_id": record.record_id,
            "category": record.category,
        })
        .to_string())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::SideEffecting
    }
}
