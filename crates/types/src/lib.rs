mod config;
mod error;
mod memory;
mod model;
mod provider;
mod session;
mod stream;
mod tool;
mod tracing;

pub use config::{
    AgentConfig, BudgetConfig, ConfigError, GatewayConfig, HttpToolConfig, HttpToolSafety,
    MemoryConfig, OPENAI_DEFAULT_BASE_URL, OPENAI_PROVIDER_ID, OpenAIProviderConfig,
    ProviderConfigs, ProviderSelection, RateBudgetConfig, RateLimitConfig, ReliabilityConfig,
    RerankStrategyKind, RetrievalConfig, RuntimeConfig, SUPPORTED_CONFIG_MAJOR_VERSION,
    ToolsConfig, validate_config_version,
};
pub use error::{ErrorKind, MemoryError, ProviderError, RuntimeError, ToolError};
pub use memory::{Embedder, MemoryRecord, MemoryStore, NewMemory, ScoredMemory};
pub use model::{
    Context, Message, MessageRole, ModelCatalog, ModelDescriptor, ModelId, ProviderCaps,
    ProviderId, Response, StreamItem, ToolCall, ToolCallDelta, UsageUpdate,
};
pub use provider::{Provider, ProviderStream, response_to_stream_items};
pub use session::{
    ContentPart, InvalidToolCallTransition, RunFailureRecord, Session, SessionStatus,
    ToolCallRecord, ToolCallStatus, ToolFailure, TranscriptMessage, TranscriptStore,
};
pub use stream::{CURSOR_EXPIRED_CODE, SUBSCRIBER_LAGGED_CODE, StreamEvent, StreamPayload};
pub use tool::{FunctionDecl, SafetyTier, Tool, ToolContext, ToolParameterSchema};
pub use tracing::{init_tracing, init_tracing_with_default};
