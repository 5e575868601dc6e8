use std::sync::Arc;

use serde::de::DeserializeOwned;
use types::{ToolError, ToolsConfig};

mod http_tool;
mod memory_tool;
mod registry;

pub use http_tool::HttpTool;
pub use memory_tool::{MEMORY_WRITE_TOOL_NAME, MemoryWriteTool, MemoryWriter};
pub use registry::{RegistryError, ToolRegistry, ToolRegistryBuilder};

/// Name the executor intercepts as a memory-retrieval directive. No real
/// tool may claim it.
pub const RECALL_MEMORY_TOOL_NAME: &str = "recall_memory";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Builds the immutable registry for a deployment: every HTTP capability
/// declared in config plus `memory_write` when a writer is available.
pub fn build_registry(
    config: &ToolsConfig,
    memory_writer: Option<Arc<dyn MemoryWriter>>,
) -> Result<ToolRegistry, RegistryError> {
    let mut builder = ToolRegistry::builder().max_output_bytes(config.max_output_bytes);
    for tool_config in &config.http {
        builder = builder.register(HttpTool::from_config(tool_config)?);
    }
    if let Some(writer) = memory_writer {
        builder = builder.register(MemoryWriteTool::new(writer));
    }
    let registry = builder.build()?;
    tracing::info!(tools = ?registry.names(), "tool registry ready");
    Ok(registry)
}

fn parse_args<T>(tool: &str, args: &str) -> Result<T, ToolError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(args).map_err(|error| invalid_args(tool, error.to_string()))
}

fn invalid_args(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn execution_failed(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn transient(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::Transient {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn truncate_output(mut output: String, max_output_bytes: usize) -> String {
    if output.len() <= max_output_bytes {
        return output;
    }

    let original_bytes = output.len();
    let mut cutoff = max_output_bytes.min(original_bytes);
    while cutoff > 0 && !output.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    output.truncate(cutoff);
    output.push_str(&format!(
        "\n...[output truncated: {original_bytes} bytes total]"
    ));
    output
}

#[cfg(test)]
mod tests;
