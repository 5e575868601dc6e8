use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ModelId, ProviderId};

pub const SUPPORTED_CONFIG_MAJOR_VERSION: u64 = 1;
pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";

const MIN_RETRIEVAL_CACHE_TTL_SECS: u64 = 30;
const MAX_RETRIEVAL_CACHE_TTL_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub selection: ProviderSelection,
    #[serde(default)]
    pub providers: ProviderConfigs,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            runtime: RuntimeConfig::default(),
            budget: BudgetConfig::default(),
            memory: MemoryConfig::default(),
            selection: ProviderSelection::default(),
            providers: ProviderConfigs::default(),
            reliability: ReliabilityConfig::default(),
            rate_limits: RateLimitConfig::default(),
            gateway: GatewayConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config_version(&self.config_version)?;

        let provider = self.selection.provider.0.as_str();
        if provider != OPENAI_PROVIDER_ID {
            return Err(ConfigError::UnsupportedProvider {
                provider: provider.to_owned(),
            });
        }

        if self.selection.model.0.trim().is_empty() {
            return Err(ConfigError::EmptyModelForProvider {
                provider: provider.to_owned(),
            });
        }

        self.runtime.validate()?;
        self.budget.validate()?;

        if self.reliability.max_attempts == 0 {
            return Err(ConfigError::InvalidReliabilityAttempts { attempts: 0 });
        }

        if self.reliability.backoff_base_ms == 0
            || self.reliability.backoff_max_ms == 0
            || self.reliability.backoff_base_ms > self.reliability.backoff_max_ms
        {
            return Err(ConfigError::InvalidReliabilityBackoff {
                base_ms: self.reliability.backoff_base_ms,
                max_ms: self.reliability.backoff_max_ms,
            });
        }

        self.memory.validate()?;
        self.rate_limits.validate()?;
        self.gateway.validate()?;
        self.tools.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_model_call_timeout_secs")]
    pub model_call_timeout_secs: u64,
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            run_timeout_secs: default_run_timeout_secs(),
            model_call_timeout_secs: default_model_call_timeout_secs(),
            tool_concurrency: default_tool_concurrency(),
            approval_timeout_secs: default_approval_timeout_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            system_prompt: None,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_steps", self.max_steps as u64),
            ("run_timeout_secs", self.run_timeout_secs),
            ("model_call_timeout_secs", self.model_call_timeout_secs),
            ("tool_concurrency", self.tool_concurrency as u64),
            ("approval_timeout_secs", self.approval_timeout_secs),
            ("event_queue_capacity", self.event_queue_capacity as u64),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidRuntimeLimit { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_fallback_context_tokens")]
    pub fallback_context_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_max_tokens: Option<u32>,
    /// Context windows for models the built-in catalog does not know.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_windows: BTreeMap<String, u32>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            fallback_context_tokens: default_fallback_context_tokens(),
            requested_max_tokens: None,
            context_windows: BTreeMap::new(),
        }
    }
}

impl BudgetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_context_tokens == 0 {
            return Err(ConfigError::InvalidRuntimeLimit {
                field: "fallback_context_tokens",
                value: 0,
            });
        }
        if let Some((model, _)) = self.context_windows.iter().find(|(_, window)| **window == 0) {
            return Err(ConfigError::InvalidContextWindow {
                model: model.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_db_path")]
    pub db_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_memory_db_path(),
            remote_url: None,
            auth_token: None,
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.retrieval.validate()?;

        if !self.enabled {
            return Ok(());
        }

        let remote_url = self
            .remote_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());
        if let Some(remote_url) = remote_url {
            if self
                .auth_token
                .as_deref()
                .map(str::trim)
                .is_none_or(str::is_empty)
            {
                return Err(ConfigError::MissingMemoryAuthToken {
                    remote_url: remote_url.to_owned(),
                });
            }
            return Ok(());
        }

        if self.db_path.trim().is_empty() {
            return Err(ConfigError::InvalidMemoryDatabasePath);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategyKind {
    #[default]
    WeightedFusion,
    ReciprocalRankFusion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_candidate_factor")]
    pub candidate_factor: usize,
    #[serde(default = "default_retrieval_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_retrieval_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_retrieval_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_retrieval_token_budget")]
    pub token_budget: u32,
    #[serde(default)]
    pub strategy: RerankStrategyKind,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_retrieval_top_k(),
            candidate_factor: default_retrieval_candidate_factor(),
            vector_weight: default_retrieval_vector_weight(),
            keyword_weight: default_retrieval_keyword_weight(),
            cache_ttl_secs: default_retrieval_cache_ttl_secs(),
            token_budget: default_retrieval_token_budget(),
            strategy: RerankStrategyKind::default(),
        }
    }
}

impl RetrievalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        const WEIGHT_SUM_EPSILON: f64 = 1e-6;

        if self.top_k == 0 {
            return Err(ConfigError::InvalidRetrievalTopK { value: 0 });
        }
        if self.candidate_factor < 2 {
            return Err(ConfigError::InvalidRetrievalCandidateFactor {
                value: self.candidate_factor,
            });
        }
        if !is_ratio(self.vector_weight) {
            return Err(ConfigError::InvalidRetrievalWeight {
                field: "vector_weight",
                value: self.vector_weight,
            });
        }
        if !is_ratio(self.keyword_weight) {
            return Err(ConfigError::InvalidRetrievalWeight {
                field: "keyword_weight",
                value: self.keyword_weight,
            });
        }
        let weight_sum = self.vector_weight + self.keyword_weight;
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigError::InvalidRetrievalWeightSum {
                vector_weight: self.vector_weight,
                keyword_weight: self.keyword_weight,
            });
        }
        if !(MIN_RETRIEVAL_CACHE_TTL_SECS..=MAX_RETRIEVAL_CACHE_TTL_SECS)
            .contains(&self.cache_ttl_secs)
        {
            return Err(ConfigError::InvalidRetrievalCacheTtl {
                value: self.cache_ttl_secs,
            });
        }
        if self.token_budget == 0 {
            return Err(ConfigError::InvalidRuntimeLimit {
                field: "memory.retrieval.token_budget",
                value: 0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    #[serde(default = "default_provider_id")]
    pub provider: ProviderId,
    #[serde(default = "default_model_id")]
    pub model: ModelId,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self {
            provider: default_provider_id(),
            model: default_model_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderConfigs {
    #[serde(default)]
    pub openai: OpenAIProviderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for OpenAIProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudgetConfig {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_stream_start_budget")]
    pub stream_start: RateBudgetConfig,
    #[serde(default = "default_tool_invocation_budget")]
    pub tool_invocation: RateBudgetConfig,
    #[serde(default = "default_memory_write_budget")]
    pub memory_write: RateBudgetConfig,
    #[serde(default = "default_memory_read_budget")]
    pub memory_read: RateBudgetConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            stream_start: default_stream_start_budget(),
            tool_invocation: default_tool_invocation_budget(),
            memory_write: default_memory_write_budget(),
            memory_read: default_memory_read_budget(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (operation, budget) in [
            ("stream_start", self.stream_start),
            ("tool_invocation", self.tool_invocation),
            ("memory_write", self.memory_write),
            ("memory_read", self.memory_read),
        ] {
            if budget.limit == 0 || budget.window_secs == 0 {
                return Err(ConfigError::InvalidRateBudget {
                    operation,
                    limit: budget.limit,
                    window_secs: budget.window_secs,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// How long a finished run's events stay available for resume.
    #[serde(default = "default_finished_run_retention_secs")]
    pub finished_run_retention_secs: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
    #[serde(default = "default_allowed_attachment_types")]
    pub allowed_attachment_types: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            event_buffer_capacity: default_event_buffer_capacity(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            finished_run_retention_secs: default_finished_run_retention_secs(),
            max_message_chars: default_max_message_chars(),
            max_attachments: default_max_attachments(),
            max_attachment_bytes: default_max_attachment_bytes(),
            allowed_attachment_types: default_allowed_attachment_types(),
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::InvalidBindAddress);
        }
        let limits = [
            ("event_buffer_capacity", self.event_buffer_capacity as u64),
            (
                "subscriber_queue_capacity",
                self.subscriber_queue_capacity as u64,
            ),
            ("max_message_chars", self.max_message_chars as u64),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidRuntimeLimit { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HttpToolSafety {
    #[default]
    ReadOnly,
    SideEffecting,
    Sensitive,
}

/// An external capability reached over HTTP, declared in `tools.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub endpoint: String,
    #[serde(default = "default_http_tool_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub safety: HttpToolSafety,
    #[serde(default = "default_http_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpToolConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
            http: Vec::new(),
        }
    }
}

impl ToolsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for tool in &self.http {
            let name = tool.name.trim();
            if name.is_empty()
                || !name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
            {
                return Err(ConfigError::InvalidToolName {
                    name: tool.name.clone(),
                });
            }
            if !seen.insert(name.to_owned()) {
                return Err(ConfigError::DuplicateToolName {
                    name: name.to_owned(),
                });
            }
            if tool.endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidToolEndpoint {
                    name: name.to_owned(),
                });
            }
            if tool.timeout_secs == 0 {
                return Err(ConfigError::InvalidRuntimeLimit {
                    field: "tools.http.timeout_secs",
                    value: 0,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unsupported config_version `{version}`; supported major is {supported_major}")]
    UnsupportedConfigVersion {
        version: String,
        supported_major: u64,
    },
    #[error("invalid config_version format `{version}`")]
    InvalidConfigVersionFormat { version: String },
    #[error("unsupported provider `{provider}` in provider selection")]
    UnsupportedProvider { provider: String },
    #[error("selected model is empty for provider `{provider}`")]
    EmptyModelForProvider { provider: String },
    #[error("runtime limit `{field}` must be greater than zero; got {value}")]
    InvalidRuntimeLimit { field: &'static str, value: u64 },
    #[error("context window for model `{model}` must be greater than zero")]
    InvalidContextWindow { model: String },
    #[error("memory retrieval top_k must be greater than zero; got {value}")]
    InvalidRetrievalTopK { value: usize },
    #[error("memory retrieval candidate_factor must be at least 2; got {value}")]
    InvalidRetrievalCandidateFactor { value: usize },
    #[error("memory retrieval weight `{field}` must be within [0.0, 1.0]; got {value}")]
    InvalidRetrievalWeight { field: &'static str, value: f64 },
    #[error(
        "memory retrieval weights must sum to 1.0; got vector_weight={vector_weight} and keyword_weight={keyword_weight}"
    )]
    InvalidRetrievalWeightSum {
        vector_weight: f64,
        keyword_weight: f64,
    },
    #[error("memory retrieval cache_ttl_secs must be within [30, 120]; got {value}")]
    InvalidRetrievalCacheTtl { value: u64 },
    #[error("reliability max_attempts must be greater than zero; got {attempts}")]
    InvalidReliabilityAttempts { attempts: u32 },
    #[error(
        "invalid reliability backoff bounds base={base_ms}ms max={max_ms}ms (both must be >0 and base<=max)"
    )]
    InvalidReliabilityBackoff { base_ms: u64, max_ms: u64 },
    #[error(
        "rate limit for `{operation}` needs a positive limit and window; got limit={limit} window_secs={window_secs}"
    )]
    InvalidRateBudget {
        operation: &'static str,
        limit: u32,
        window_secs: u64,
    },
    #[error("gateway bind_address must not be empty")]
    InvalidBindAddress,
    #[error("tool name `{name}` must be non-empty and use only [A-Za-z0-9_-]")]
    InvalidToolName { name: String },
    #[error("tool `{name}` is declared more than once")]
    DuplicateToolName { name: String },
    #[error("tool `{name}` has an empty endpoint")]
    InvalidToolEndpoint { name: String },
    #[error("memory database path must not be empty when memory is enabled in local mode")]
    InvalidMemoryDatabasePath,
    #[error("memory remote mode requires an auth token for `{remote_url}`")]
    MissingMemoryAuthToken { remote_url: String },
}

pub fn validate_config_version(config_version: &str) -> Result<(), ConfigError> {
    let major = parse_major_version(config_version)?;
    if major != SUPPORTED_CONFIG_MAJOR_VERSION {
        return Err(ConfigError::UnsupportedConfigVersion {
            version: config_version.trim().to_owned(),
            supported_major: SUPPORTED_CONFIG_MAJOR_VERSION,
        });
    }
    Ok(())
}

fn parse_major_version(config_version: &str) -> Result<u64, ConfigError> {
    let trimmed = config_version.trim();
    let invalid = || ConfigError::InvalidConfigVersionFormat {
        version: trimmed.to_owned(),
    };
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidConfigVersionFormat {
            version: config_version.to_owned(),
        });
    }

    let mut parts = trimmed.split('.');
    let first = parts.next().ok_or_else(invalid)?;
    let is_numeric = |part: &str| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit());
    if !is_numeric(first) || !parts.all(is_numeric) {
        return Err(invalid());
    }

    first.parse::<u64>().map_err(|_| invalid())
}

fn default_config_version() -> String {
    "1.0.0".to_owned()
}

fn default_provider_id() -> ProviderId {
    ProviderId::from(OPENAI_PROVIDER_ID)
}

fn default_model_id() -> ModelId {
    ModelId::from("gpt-4o-mini")
}

fn default_openai_base_url() -> String {
    OPENAI_DEFAULT_BASE_URL.to_owned()
}

fn default_max_steps() -> usize {
    12
}

fn default_run_timeout_secs() -> u64 {
    120
}

fn default_model_call_timeout_secs() -> u64 {
    60
}

fn default_tool_concurrency() -> usize {
    4
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_event_queue_capacity() -> usize {
    64
}

fn default_fallback_context_tokens() -> u32 {
    8_192
}

fn default_memory_db_path() -> String {
    ".wayfarer/memory.db".to_owned()
}

fn default_retrieval_top_k() -> usize {
    8
}

fn default_retrieval_candidate_factor() -> usize {
    4
}

fn default_retrieval_vector_weight() -> f64 {
    0.7
}

fn default_retrieval_keyword_weight() -> f64 {
    0.3
}

fn default_retrieval_cache_ttl_secs() -> u64 {
    60
}

fn default_retrieval_token_budget() -> u32 {
    1_024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_jitter() -> bool {
    true
}

fn default_stream_start_budget() -> RateBudgetConfig {
    RateBudgetConfig {
        limit: 20,
        window_secs: 60,
    }
}

fn default_tool_invocation_budget() -> RateBudgetConfig {
    RateBudgetConfig {
        limit: 60,
        window_secs: 60,
    }
}

fn default_memory_write_budget() -> RateBudgetConfig {
    RateBudgetConfig {
        limit: 30,
        window_secs: 60,
    }
}

fn default_memory_read_budget() -> RateBudgetConfig {
    RateBudgetConfig {
        limit: 120,
        window_secs: 60,
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_event_buffer_capacity() -> usize {
    512
}

fn default_subscriber_queue_capacity() -> usize {
    128
}

fn default_finished_run_retention_secs() -> u64 {
    300
}

fn default_max_message_chars() -> usize {
    8_000
}

fn default_max_attachments() -> usize {
    4
}

fn default_max_attachment_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_allowed_attachment_types() -> Vec<String> {
    ["image/png", "image/jpeg", "application/pdf", "text/plain"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_http_tool_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn default_http_tool_timeout_secs() -> u64 {
    15
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

fn is_ratio(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}
