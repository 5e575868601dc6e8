use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolError;

/// How dangerous a tool invocation is.
///
/// `Sensitive` tools spend money, send communications, or touch another
/// principal's data. They are attempted at most once and only after an
/// explicit approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    ReadOnly,
    SideEffecting,
    Sensitive,
}

impl SafetyTier {
    pub fn requires_approval(self) -> bool {
        matches!(self, Self::Sensitive)
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// A tool parameter schema expressed as a raw JSON Schema value.
///
/// Construct schemas with `serde_json::json!({...})`:
///
/// ```rust,ignore
/// use serde_json::json;
/// let params = json!({
///     "type": "object",
///     "required": ["origin", "destination"],
///     "properties": {
///         "origin":      { "type": "string", "minLength": 3 },
///         "destination": { "type": "string", "minLength": 3 },
///         "passengers":  { "type": "integer", "minimum": 1, "maximum": 9 }
///     }
/// });
/// ```
pub type ToolParameterSchema = Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: ToolParameterSchema,
}

impl FunctionDecl {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        parameters: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            parameters,
        }
    }
}

/// Who a tool call runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub principal_id: String,
    pub session_id: String,
}

impl ToolContext {
    pub fn new(principal_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> FunctionDecl;

    async fn execute(&self, args: &str, context: &ToolContext) -> Result<String, ToolError>;

    fn timeout(&self) -> Duration;

    fn safety_tier(&self) -> SafetyTier;

    /// Results of read-only tools may be served from the result cache for
    /// this long. `None` disables caching.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }
}
