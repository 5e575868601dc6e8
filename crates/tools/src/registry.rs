use std::{collections::BTreeMap, sync::Arc};

use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;
use types::{FunctionDecl, Tool, ToolContext, ToolError};

use crate::{DEFAULT_MAX_OUTPUT_BYTES, RECALL_MEMORY_TOOL_NAME, invalid_args, truncate_output};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool `{name}` is registered more than once")]
    DuplicateTool { name: String },
    #[error("tool name `{name}` is reserved")]
    ReservedName { name: String },
    #[error("tool `{name}` has an invalid parameter schema: {message}")]
    InvalidSchema { name: String, message: String },
    #[error("tool `{name}` has an invalid endpoint: {message}")]
    InvalidEndpoint { name: String, message: String },
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    decl: FunctionDecl,
    validator: Validator,
}

/// Immutable set of tools with pre-compiled argument validators.
///
/// Built once at startup through [`ToolRegistryBuilder`] and shared by
/// `Arc`; there is no way to add or remove tools afterwards.
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    max_output_bytes: usize,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<FunctionDecl> {
        self.tools.values().map(|entry| entry.decl.clone()).collect()
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Checks `arguments` against the tool's JSON schema.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), ToolError> {
        let entry = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            tool: name.to_owned(),
        })?;
        if entry.validator.is_valid(arguments) {
            return Ok(());
        }
        let messages = entry
            .validator
            .iter_errors(arguments)
            .map(|error| format!("- {error}"))
            .collect::<Vec<_>>();
        Err(invalid_args(
            name,
            format!("schema validation failed:\n{}", messages.join("\n")),
        ))
    }

    /// Runs one attempt of the tool under its own timeout and truncates the
    /// output. Validation, retries and approval are the caller's concern.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &Value,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let entry = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            tool: name.to_owned(),
        })?;
        let args = serde_json::to_string(arguments)?;
        let timeout = entry.tool.timeout();
        let output = tokio::time::timeout(timeout, entry.tool.execute(&args, context))
            .await
            .map_err(|_| ToolError::Timeout {
                tool: name.to_owned(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        Ok(truncate_output(output, self.max_output_bytes))
    }
}

pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
    max_output_bytes: usize,
}

impl Default for ToolRegistryBuilder {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ToolRegistryBuilder {
    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes.max(1);
        self
    }

    pub fn register<T>(self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, RegistryError> {
        let mut tools = BTreeMap::new();
        for tool in self.tools {
            let decl = tool.schema();
            let name = decl.name.clone();
            if name == RECALL_MEMORY_TOOL_NAME {
                return Err(RegistryError::ReservedName { name });
            }
            if tools.contains_key(&name) {
                return Err(RegistryError::DuplicateTool { name });
            }
            let validator = jsonschema::validator_for(&decl.parameters).map_err(|error| {
                RegistryError::InvalidSchema {
                    name: name.clone(),
                    message: error.to_string(),
                }
            })?;
            tools.insert(
                name,
                RegisteredTool {
                    tool,
                    decl,
                    validator,
                },
            );
        }
        Ok(ToolRegistry {
            tools,
            max_output_bytes: self.max_output_bytes,
        })
    }
}
