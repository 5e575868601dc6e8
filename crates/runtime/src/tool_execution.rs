use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use provider::RetryPolicy;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tools::ToolRegistry;
use types::{
    ErrorKind, InvalidToolCallTransition, SafetyTier, ToolCallRecord, ToolCallStatus, ToolContext,
    ToolError,
};

use crate::cache::{CacheKey, ResultCache};
use crate::rate_limit::RateLimiter;

pub const APPROVAL_TIMEOUT_REASON: &str = "approval_timeout";
pub const APPROVAL_CANCELLED_REASON: &str = "cancelled";
const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("no approval is pending for tool call `{tool_call_id}`")]
    NotPending { tool_call_id: String },
    #[error("tool call `{tool_call_id}` does not belong to session `{session_id}`")]
    SessionMismatch {
        session_id: String,
        tool_call_id: String,
    },
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotPending { .. } => ErrorKind::NotFound,
            Self::SessionMismatch { .. } => ErrorKind::Authorization,
        }
    }
}

struct PendingApproval {
    session_id: String,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// Outstanding approval requests for sensitive tool calls, keyed by tool
/// call id.
#[derive(Default)]
pub struct ApprovalRegistry {
    pending: DashMap<String, PendingApproval>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            tool_call_id.to_owned(),
            PendingApproval {
                session_id: session_id.to_owned(),
                sender,
            },
        );
        receiver
    }

    pub fn resolve(
        &self,
        session_id: &str,
        tool_call_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let Some((_, pending)) = self
            .pending
            .remove_if(tool_call_id, |_, pending| pending.session_id == session_id)
        else {
            if self.pending.contains_key(tool_call_id) {
                return Err(ApprovalError::SessionMismatch {
                    session_id: session_id.to_owned(),
                    tool_call_id: tool_call_id.to_owned(),
                });
            }
            return Err(ApprovalError::NotPending {
                tool_call_id: tool_call_id.to_owned(),
            });
        };
        pending
            .sender
            .send(decision)
            .map_err(|_| ApprovalError::NotPending {
                tool_call_id: tool_call_id.to_owned(),
            })
    }

    pub fn pending_for(&self, session_id: &str) -> Vec<String> {
        let mut ids = self
            .pending
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn withdraw(&self, tool_call_id: &str) {
        self.pending.remove(tool_call_id);
    }
}

/// Receives every status change of a tool call, including the initial
/// `pending` state.
#[async_trait]
pub trait ToolCallObserver: Send + Sync {
    async fn on_transition(&self, record: &ToolCallRecord);
}

pub struct NoopObserver;

#[async_trait]
impl ToolCallObserver for NoopObserver {
    async fn on_transition(&self, _record: &ToolCallRecord) {}
}

/// Drives one tool call from `pending` to a terminal status: schema
/// validation, rate limiting, the approval gate, retries and caching.
pub struct ToolExecutionEngine {
    registry: Arc<ToolRegistry>,
    rate_limiter: Arc<RateLimiter>,
    approvals: Arc<ApprovalRegistry>,
    cache: ResultCache<String>,
    retry_policy: RetryPolicy,
    approval_timeout: Duration,
}

impl ToolExecutionEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        rate_limiter: Arc<RateLimiter>,
        approvals: Arc<ApprovalRegistry>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            approvals,
            cache: ResultCache::new(),
            retry_policy: RetryPolicy::default(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy.normalized();
        self
    }

    pub fn with_approval_timeout(mut self, approval_timeout: Duration) -> Self {
        self.approval_timeout = approval_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalRegistry> {
        &self.approvals
    }

    pub fn cache(&self) -> &ResultCache<String> {
        &self.cache
    }

    /// Executes `record`, which must be `pending`, and returns it in a
    /// terminal status.
    ///
    /// Cancellation fails a call that has not started and rejects one still
    /// waiting for approval; once a call is executing it runs to completion.
    pub async fn execute(
        &self,
        mut record: ToolCallRecord,
        context: &ToolContext,
        observer: &dyn ToolCallObserver,
        cancellation: &CancellationToken,
    ) -> ToolCallRecord {
        if record.status != ToolCallStatus::Pending {
            tracing::warn!(
                tool_call_id = %record.tool_call_id,
                status = %record.status,
                "tool call handed to the engine outside the pending state"
            );
            return record;
        }
        let name = record.tool_name.clone();
        if cancellation.is_cancelled() {
            tracing::debug!(
                tool = %name,
                tool_call_id = %record.tool_call_id,
                "run cancelled before tool call started"
            );
            log_refused(record.fail(
                ErrorKind::Cancelled,
                "run cancelled before the tool call started",
            ));
            observer.on_transition(&record).await;
            return record;
        }

        if let Err(error) = self.registry.validate(&name, &record.input) {
            tracing::debug!(tool = %name, %error, "tool call failed validation");
            log_refused(record.fail(error.kind(), error.to_string()));
            observer.on_transition(&record).await;
            return record;
        }
        let Some(tool) = self.registry.get(&name) else {
            let error = ToolError::UnknownTool { tool: name };
            log_refused(record.fail(error.kind(), error.to_string()));
            observer.on_transition(&record).await;
            return record;
        };

        let tier = tool.safety_tier();
        let decision = self
            .rate_limiter
            .check_tool_invocation(&context.principal_id, tier.is_read_only())
            .await;
        if !decision.allowed {
            let error = ToolError::RateLimited {
                tool: name,
                retry_after_ms: decision.retry_after_ms,
            };
            log_refused(record.fail(error.kind(), error.to_string()));
            observer.on_transition(&record).await;
            return record;
        }

        if tier.requires_approval() {
            let receiver = self
                .approvals
                .register(&record.session_id, &record.tool_call_id);
            log_refused(record.transition(ToolCallStatus::AwaitingApproval));
            observer.on_transition(&record).await;

            let approval = self.await_approval(&record, receiver, cancellation).await;
            if let Err(reason) = approval {
                tracing::info!(tool = %name, tool_call_id = %record.tool_call_id, %reason, "tool call rejected");
                log_refused(record.reject(reason));
                observer.on_transition(&record).await;
                return record;
            }
        }

        log_refused(record.transition(ToolCallStatus::Executing));
        observer.on_transition(&record).await;

        let outcome = match tool.cache_ttl().filter(|_| tier.is_read_only()) {
            Some(ttl) => self.execute_cached(&mut record, context, ttl).await,
            None => self.execute_with_retry(&mut record, tier, context).await,
        };
        match outcome {
            Ok(output) => log_refused(record.succeed(output)),
            Err(error) => {
                tracing::warn!(tool = %name, attempts = record.attempts, %error, "tool call failed");
                log_refused(record.fail(error.kind(), error.to_string()));
            }
        }
        observer.on_transition(&record).await;
        record
    }

    async fn await_approval(
        &self,
        record: &ToolCallRecord,
        receiver: oneshot::Receiver<ApprovalDecision>,
        cancellation: &CancellationToken,
    ) -> Result<(), String> {
        let outcome = tokio::select! {
            _ = cancellation.cancelled() => Err(APPROVAL_CANCELLED_REASON.to_owned()),
            decided = tokio::time::timeout(self.approval_timeout, receiver) => match decided {
                Ok(Ok(ApprovalDecision::Approve)) => Ok(()),
                Ok(Ok(ApprovalDecision::Reject { reason })) => {
                    Err(reason.unwrap_or_else(|| "rejected by user".to_owned()))
                }
                Ok(Err(_)) => Err(APPROVAL_CANCELLED_REASON.to_owned()),
                Err(_) => Err(APPROVAL_TIMEOUT_REASON.to_owned()),
            },
        };
        self.approvals.withdraw(&record.tool_call_id);
        outcome
    }

    async fn execute_cached(
        &self,
        record: &mut ToolCallRecord,
        context: &ToolContext,
        ttl: Duration,
    ) -> Result<String, ToolError> {
        let namespace = format!("tool:{}:{}", record.tool_name, context.principal_id);
        let key = CacheKey::from_parts(&namespace, &record.input)?;
        if let Some(output) = self.cache.get(&key) {
            tracing::debug!(tool = %record.tool_name, "tool result served from cache");
            return Ok(output);
        }
        let output = self
            .execute_with_retry(record, SafetyTier::ReadOnly, context)
            .await?;
        let tags = [format!("tool:{}", record.tool_name)];
        self.cache.insert(key, output.clone(), ttl, &tags);
        Ok(output)
    }

    async fn execute_with_retry(
        &self,
        record: &mut ToolCallRecord,
        tier: SafetyTier,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let max_attempts = if tier.requires_approval() {
            1
        } else {
            self.retry_policy.max_attempts.max(1)
        };
        loop {
            record.attempts += 1;
            match self
                .registry
                .invoke(&record.tool_name, &record.input, context)
                .await
            {
                Ok(output) => return Ok(output),
                Err(error) if error.is_retriable() && record.attempts < max_attempts => {
                    let delay = self.retry_policy.full_jitter_delay(record.attempts);
                    tracing::warn!(
                        tool = %record.tool_name,
                        attempt = record.attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying tool call after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn log_refused(result: Result<(), InvalidToolCallTransition>) {
    if let Err(error) = result {
        tracing::error!(%error, "tool call transition refused");
    }
}
