use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use types::{RateBudgetConfig, RateLimitConfig};

/// Retry hint used when a side-effecting operation is refused because the
/// backend itself is unavailable.
const BACKEND_FAILURE_RETRY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    StreamStart,
    ToolInvocation,
    MemoryWrite,
    MemoryRead,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamStart => "stream_start",
            Self::ToolInvocation => "tool_invocation",
            Self::MemoryWrite => "memory_write",
            Self::MemoryRead => "memory_read",
        }
    }

    /// Read-only operations are let through when the backend fails.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::MemoryRead)
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: u32,
    pub window: Duration,
}

impl From<RateBudgetConfig> for RateBudget {
    fn from(config: RateBudgetConfig) -> Self {
        Self {
            limit: config.limit,
            window: Duration::from_secs(config.window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudgets {
    pub stream_start: RateBudget,
    pub tool_invocation: RateBudget,
    pub memory_write: RateBudget,
    pub memory_read: RateBudget,
}

impl RateBudgets {
    pub fn for_operation(&self, operation: OperationClass) -> RateBudget {
        match operation {
            OperationClass::StreamStart => self.stream_start,
            OperationClass::ToolInvocation => self.tool_invocation,
            OperationClass::MemoryWrite => self.memory_write,
            OperationClass::MemoryRead => self.memory_read,
        }
    }
}

impl From<&RateLimitConfig> for RateBudgets {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            stream_start: config.stream_start.into(),
            tool_invocation: config.tool_invocation.into(),
            memory_write: config.memory_write.into(),
            memory_read: config.memory_read.into(),
        }
    }
}

impl Default for RateBudgets {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
    pub remaining: u32,
}

impl RateDecision {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            remaining,
        }
    }

    fn denied(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: retry_after_ms.max(1),
            remaining: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend unavailable: {message}")]
    Backend { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub principal_id: String,
    pub operation: OperationClass,
}

/// Storage for sliding-window logs. `record` must check and update a key
/// atomically.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn record(
        &self,
        key: &RateKey,
        budget: RateBudget,
        now: Instant,
    ) -> Result<RateDecision, RateLimitError>;

    /// Drops keys whose window has emptied. Returns how many were removed.
    fn purge_idle(&self, _now: Instant, _budgets: &RateBudgets) -> usize {
        0
    }
}

/// Sharded in-process backend; each key's log is updated under its shard
/// lock.
#[derive(Default)]
pub struct InProcessRateLimitBackend {
    buckets: DashMap<RateKey, VecDeque<Instant>>,
}

impl InProcessRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn prune(log: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(oldest) = log.front() {
        if now.saturating_duration_since(*oldest) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl RateLimitBackend for InProcessRateLimitBackend {
    async fn record(
        &self,
        key: &RateKey,
        budget: RateBudget,
        now: Instant,
    ) -> Result<RateDecision, RateLimitError> {
        let mut log = self.buckets.entry(key.clone()).or_default();
        prune(&mut log, budget.window, now);

        let used = u32::try_from(log.len()).unwrap_or(u32::MAX);
        if used < budget.limit {
            log.push_back(now);
            return Ok(RateDecision::allowed(budget.limit - used - 1));
        }

        let retry_after = log
            .front()
            .map(|oldest| budget.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(budget.window);
        let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        Ok(RateDecision::denied(retry_after_ms))
    }

    fn purge_idle(&self, now: Instant, budgets: &RateBudgets) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, log| {
            prune(log, budgets.for_operation(key.operation).window, now);
            !log.is_empty()
        });
        before - self.buckets.len()
    }
}

/// Per-principal, per-operation sliding-window limiter.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    budgets: RateBudgets,
}

impl RateLimiter {
    pub fn new(budgets: RateBudgets) -> Self {
        Self::with_backend(budgets, Arc::new(InProcessRateLimitBackend::new()))
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(RateBudgets::from(config))
    }

    pub fn with_backend(budgets: RateBudgets, backend: Arc<dyn RateLimitBackend>) -> Self {
        Self { backend, budgets }
    }

    pub fn budgets(&self) -> &RateBudgets {
        &self.budgets
    }

    /// Records one attempt and says whether it may proceed.
    pub async fn check(&self, principal_id: &str, operation: OperationClass) -> RateDecision {
        self.record(principal_id, operation, operation.is_read_only())
            .await
    }

    /// Tool invocations share one budget, but only read-only tools are let
    /// through when the backend fails.
    pub async fn check_tool_invocation(&self, principal_id: &str, read_only: bool) -> RateDecision {
        self.record(principal_id, OperationClass::ToolInvocation, read_only)
            .await
    }

    async fn record(
        &self,
        principal_id: &str,
        operation: OperationClass,
        fail_open: bool,
    ) -> RateDecision {
        let key = RateKey {
            principal_id: principal_id.to_owned(),
            operation,
        };
        let budget = self.budgets.for_operation(operation);
        match self.backend.record(&key, budget, Instant::now()).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(
                        principal_id,
                        operation = %operation,
                        retry_after_ms = decision.retry_after_ms,
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(error) if fail_open => {
                tracing::warn!(%error, operation = %operation, "rate limiter failing open");
                RateDecision::allowed(0)
            }
            Err(error) => {
                tracing::warn!(%error, operation = %operation, "rate limiter failing closed");
                RateDecision::denied(BACKEND_FAILURE_RETRY_MS)
            }
        }
    }

    pub fn purge_idle(&self) -> usize {
        self.backend.purge_idle(Instant::now(), &self.budgets)
    }
}
