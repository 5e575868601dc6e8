//! Agent orchestration: the graph executor and the services it drives
//! (token budgeting, rate limiting, result caching, memory retrieval and
//! tool execution).

mod budget;
mod cache;
mod executor;
mod provider_response;
mod rate_limit;
mod retrieval;
mod tool_execution;

pub use budget::{
    CLAMPED_INVALID_REQUEST, CLAMPED_MODEL_LIMIT, HeuristicTokenCounter, ModelFamily,
    ModelLimits, TokenBudget, TokenCounter, TokenEstimate, compute_max_completion_tokens,
};
pub use cache::{CacheKey, ResultCache};
pub use executor::{
    AgentGraphExecutor, ExecutorSettings, ExecutorState, RunOutcome, RunRequest,
    recall_memory_decl,
};
pub use rate_limit::{
    InProcessRateLimitBackend, OperationClass, RateBudget, RateBudgets, RateDecision, RateKey,
    RateLimitBackend, RateLimitError, RateLimiter,
};
pub use retrieval::{
    DEFAULT_RRF_K, MemoryRetriever, ReciprocalRankFusion, RerankStrategy, Retrieval,
    RetrieverSettings, WeightedFusion, memory_cache_tag, strategy_from_config,
};
pub use tool_execution::{
    APPROVAL_CANCELLED_REASON, APPROVAL_TIMEOUT_REASON, ApprovalDecision, ApprovalError,
    ApprovalRegistry, NoopObserver, ToolCallObserver, ToolExecutionEngine,
};

#[cfg(test)]
mod tests;
