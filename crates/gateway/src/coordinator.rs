use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use runtime::{
    AgentGraphExecutor, ApprovalDecision, HeuristicTokenCounter, MemoryRetriever,
    OperationClass, RateLimiter, RunOutcome, RunRequest, TokenCounter,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use types::{
    AgentConfig, ContentPart, ErrorKind, MemoryError, MemoryRecord, MessageRole, ModelId,
    RunFailureRecord,
    Session, SessionStatus, StreamPayload, ToolCallStatus, TranscriptMessage, TranscriptStore,
    UsageUpdate,
};

use crate::broadcast::{StreamBroadcaster, Subscription};
use crate::errors::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub max_message_chars: usize,
    pub max_attachments: usize,
    pub max_attachment_bytes: usize,
    pub allowed_attachment_types: Vec<String>,
    /// Capacity of the executor-to-broadcaster queue.
    pub event_queue_capacity: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_message_chars: config.gateway.max_message_chars,
            max_attachments: config.gateway.max_attachments,
            max_attachment_bytes: config.gateway.max_attachment_bytes,
            allowed_attachment_types: config
                .gateway
                .allowed_attachment_types
                .iter()
                .map(|content_type| content_type.trim().to_ascii_lowercase())
                .collect(),
            event_queue_capacity: config.runtime.event_queue_capacity.max(1),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline content as sent by the client (text or base64).
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: String,
    pub principal_id: String,
    pub message: String,
    pub attachments: Vec<Attachment>,
}

/// Summary returned to clients that wait for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub content: Option<String>,
    pub usage: UsageUpdate,
    pub model: ModelId,
}

/// A started run: its event subscription plus the eventual outcome.
pub struct TurnHandle {
    pub session_id: String,
    pub run_id: String,
    pub events: Subscription,
    completion: oneshot::Receiver<Result<TurnResult, GatewayError>>,
}

impl TurnHandle {
    /// Waits until the run has finished and its transcript is persisted.
    pub async fn wait(self) -> Result<TurnResult, GatewayError> {
        let Self {
            events, completion, ..
        } = self;
        drop(events);
        completion.await.unwrap_or_else(|_| {
            Err(GatewayError::Internal {
                message: "run task ended without reporting an outcome".to_owned(),
            })
        })
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub event_logs: usize,
    pub tool_results: usize,
    pub retrievals: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.event_logs + self.tool_results + self.retrievals
    }
}

struct ActiveRun {
    run_id: String,
    cancellation: CancellationToken,
}

/// Owns session state: one in-flight run per session, ownership checks,
/// persistence of each run and relaying its events to the broadcaster.
pub struct SessionCoordinator {
    executor: Arc<AgentGraphExecutor>,
    store: Arc<dyn TranscriptStore>,
    rate_limiter: Arc<RateLimiter>,
    broadcaster: Arc<StreamBroadcaster>,
    retriever: Option<Arc<MemoryRetriever>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    active: DashMap<String, ActiveRun>,
    settings: CoordinatorSettings,
}

impl SessionCoordinator {
    pub fn new(
        executor: Arc<AgentGraphExecutor>,
        store: Arc<dyn TranscriptStore>,
        rate_limiter: Arc<RateLimiter>,
        broadcaster: Arc<StreamBroadcaster>,
        settings: CoordinatorSettings,
    ) -> Self {
        let retriever = executor.retriever().cloned();
        Self {
            executor,
            store,
            rate_limiter,
            broadcaster,
            retriever,
            locks: DashMap::new(),
            active: DashMap::new(),
            settings,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StreamBroadcaster> {
        &self.broadcaster
    }

    pub fn store(&self) -> &Arc<dyn TranscriptStore> {
        &self.store
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    /// Sessions with a per-session lock currently allocated.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    /// Starts a run for one user turn and returns as soon as it is
    /// running. The session stays locked until the run's transcript is
    /// persisted, whichever way the run ends.
    pub async fn handle_turn(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> Result<TurnHandle, GatewayError> {
        let text = self.validate_turn(&request)?;
        let TurnRequest {
            session_id,
            principal_id,
            ..
        } = request;
        self.check_owner(&session_id, &principal_id).await?;

        let lock = self.locks.entry(session_id.clone()).or_default().clone();
        let guard = lock
            .try_lock_owned()
            .map_err(|_| GatewayError::SessionBusy {
                session_id: session_id.clone(),
            })?;

        let started = self
            .start_run(session_id.clone(), principal_id, text, guard)
            .await;
        if started.is_err() {
            self.release_lock(&session_id);
        }
        started
    }

    /// Persists the user message and spawns the run. `guard` is held by the
    /// run task until its transcript is persisted, or dropped here on error.
    async fn start_run(
        self: &Arc<Self>,
        session_id: String,
        principal_id: String,
        text: String,
        guard: OwnedMutexGuard<()>,
    ) -> Result<TurnHandle, GatewayError> {
        let decision = self
            .rate_limiter
            .check(&principal_id, OperationClass::StreamStart)
            .await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            });
        }

        // Re-read under the lock; the pre-check above may have raced a
        // first turn creating the session.
        let mut session = match self.check_owner(&session_id, &principal_id).await? {
            Some(session) => session,
            None => Session::new(session_id.clone(), principal_id.clone()),
        };
        let mut history = self.store.load_transcript(&session_id).await?;
        let sequence = history.last().map_or(1, |message| message.sequence + 1);

        let mut user_message = TranscriptMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            sequence,
            role: MessageRole::User,
            parts: vec![ContentPart::Text { text }],
            created_at: Utc::now(),
            token_count: 0,
        };
        user_message.token_count = HeuristicTokenCounter
            .count_messages(
                &self.executor.settings().model,
                &[user_message.to_provider_message()],
            )
            .tokens;

        session.status = SessionStatus::Running;
        session.last_activity_at = Utc::now();
        self.store.save_session(&session).await?;
        if let Err(error) = self
            .store
            .append(&session_id, std::slice::from_ref(&user_message), &[])
            .await
        {
            tracing::error!(%session_id, %error, "failed to persist the user message");
            self.mark_idle(&mut session).await;
            return Err(error.into());
        }
        history.push(user_message);

        let run_id = uuid::Uuid::new_v4().to_string();
        self.broadcaster.begin_run(&session_id, &run_id);
        let Some(events) = self.broadcaster.subscribe(&session_id, None) else {
            self.mark_idle(&mut session).await;
            return Err(GatewayError::Internal {
                message: "event log missing right after the run began".to_owned(),
            });
        };

        let cancellation = CancellationToken::new();
        self.active.insert(
            session_id.clone(),
            ActiveRun {
                run_id: run_id.clone(),
                cancellation: cancellation.clone(),
            },
        );

        let run_request = RunRequest {
            run_id: run_id.clone(),
            session_id: session_id.clone(),
            principal_id,
            history,
            next_sequence: sequence + 1,
        };
        let (completion_sender, completion) = oneshot::channel();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator
                .drive_run(run_request, session, cancellation, guard)
                .await;
            let _ = completion_sender.send(result);
        });

        tracing::info!(%session_id, %run_id, "run started");
        Ok(TurnHandle {
            session_id,
            run_id,
            events,
            completion,
        })
    }

    /// Runs a turn and waits for its final answer.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> Result<TurnResult, GatewayError> {
        self.handle_turn(request).await?.wait().await
    }

    pub async fn resolve_approval(
        &self,
        session_id: &str,
        principal_id: &str,
        tool_call_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), GatewayError> {
        self.owned_session(session_id, principal_id).await?;
        self.executor
            .tools()
            .approvals()
            .resolve(session_id, tool_call_id, decision)?;
        tracing::info!(session_id, tool_call_id, "approval resolved");
        Ok(())
    }

    /// Requests cancellation of the session's run and returns its id. The
    /// run ends `failed(cancelled)` after its current step.
    pub async fn cancel(&self, session_id: &str, principal_id: &str) -> Result<String, GatewayError> {
        self.owned_session(session_id, principal_id).await?;
        let active = self
            .active
            .get(session_id)
            .ok_or_else(|| GatewayError::NoActiveRun {
                session_id: session_id.to_owned(),
            })?;
        active.cancellation.cancel();
        tracing::info!(session_id, run_id = %active.run_id, "run cancellation requested");
        Ok(active.run_id.clone())
    }

    /// Cancels `run_id` once no client is left watching it. A no-op when a
    /// newer run owns the session or another subscriber is still attached.
    pub fn abandon_run(&self, session_id: &str, run_id: &str) -> bool {
        let watchers = self.broadcaster.live_subscriber_count(session_id);
        if watchers > 0 {
            tracing::debug!(session_id, run_id, watchers, "client left; run still watched");
            return false;
        }
        let Some(active) = self.active.get(session_id) else {
            return false;
        };
        if active.run_id != run_id || active.cancellation.is_cancelled() {
            return false;
        }
        active.cancellation.cancel();
        tracing::info!(session_id, run_id, "client disconnected; cancelling run");
        true
    }

    /// Drops expired cache entries and the event logs of long-finished runs.
    pub fn purge_expired(&self) -> PurgeReport {
        PurgeReport {
            event_logs: self.broadcaster.purge_finished(),
            tool_results: self.executor.tools().cache().purge_expired(),
            retrievals: self
                .retriever
                .as_ref()
                .map_or(0, |retriever| retriever.cache().purge_expired()),
        }
    }

    /// Resumes the event stream of the session's latest run.
    pub async fn subscribe(
        &self,
        session_id: &str,
        principal_id: &str,
        since_cursor: Option<u64>,
    ) -> Result<Subscription, GatewayError> {
        self.owned_session(session_id, principal_id).await?;
        self.broadcaster
            .subscribe(session_id, since_cursor)
            .ok_or_else(|| GatewayError::NoActiveRun {
                session_id: session_id.to_owned(),
            })
    }

    pub async fn remember(
        &self,
        principal_id: &str,
        content: &str,
        category: Option<&str>,
    ) -> Result<MemoryRecord, GatewayError> {
        let retriever = self.retriever.as_ref().ok_or(GatewayError::MemoryDisabled)?;
        if principal_id.trim().is_empty() {
            return Err(GatewayError::validation("principalId must not be empty"));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(GatewayError::validation("memory content must not be empty"));
        }
        if content.chars().count() > self.settings.max_message_chars {
            return Err(GatewayError::validation(format!(
                "memory content exceeds {} characters",
                self.settings.max_message_chars
            )));
        }
        let decision = self
            .rate_limiter
            .check(principal_id, OperationClass::MemoryWrite)
            .await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            });
        }
        Ok(retriever.remember(principal_id, content, category).await?)
    }

    async fn drive_run(
        self: Arc<Self>,
        request: RunRequest,
        mut session: Session,
        cancellation: CancellationToken,
        guard: OwnedMutexGuard<()>,
    ) -> Result<TurnResult, GatewayError> {
        let session_id = request.session_id.clone();
        let run_id = request.run_id.clone();
        let (events, mut receiver) = mpsc::channel(self.settings.event_queue_capacity);
        let executor = Arc::clone(&self.executor);
        let run = tokio::spawn(async move { executor.run(request, events, cancellation).await });

        // The terminal event goes out only once the transcript is durable.
        let mut terminal = None;
        while let Some(payload) = receiver.recv().await {
            self.track_status(&mut session, &payload).await;
            if payload.is_terminal() {
                terminal = Some(payload);
            } else {
                self.broadcaster.publish(&session_id, payload);
            }
        }

        let result = match run.await {
            Ok(outcome) => match self.persist_transcript(&session_id, &outcome).await {
                Ok(()) => {
                    match terminal {
                        Some(payload) => {
                            self.broadcaster.publish(&session_id, payload);
                        }
                        None => tracing::warn!(%session_id, %run_id, "run ended without a terminal event"),
                    }
                    self.finish_outcome(&session_id, outcome).await
                }
                Err(error) => {
                    let message = format!("failed to persist run transcript: {error}");
                    tracing::error!(%session_id, %run_id, %error, "failed to persist run transcript");
                    self.broadcaster
                        .publish(&session_id, StreamPayload::error(ErrorKind::Internal, &message));
                    self.record_failure(&session_id, &run_id, ErrorKind::Internal, &message)
                        .await;
                    Err(GatewayError::Internal { message })
                }
            },
            Err(error) => {
                let message = if error.is_panic() {
                    "run task panicked"
                } else {
                    "run task was aborted"
                };
                tracing::error!(%session_id, %run_id, %error, "{message}");
                self.broadcaster
                    .publish(&session_id, StreamPayload::error(ErrorKind::Internal, message));
                self.record_failure(&session_id, &run_id, ErrorKind::Internal, message)
                    .await;
                Err(GatewayError::Internal {
                    message: message.to_owned(),
                })
            }
        };

        self.mark_idle(&mut session).await;
        self.active
            .remove_if(&session_id, |_, active| active.run_id == run_id);
        drop(guard);
        self.release_lock(&session_id);
        tracing::info!(%session_id, %run_id, ok = result.is_ok(), "run finished");
        result
    }

    async fn persist_transcript(
        &self,
        session_id: &str,
        outcome: &RunOutcome,
    ) -> Result<(), MemoryError> {
        self.store
            .append(session_id, &outcome.messages, &outcome.tool_calls)
            .await
    }

    async fn finish_outcome(
        &self,
        session_id: &str,
        outcome: RunOutcome,
    ) -> Result<TurnResult, GatewayError> {
        match outcome.result {
            Ok(content) => Ok(TurnResult {
                content,
                usage: outcome.usage,
                model: outcome.model,
            }),
            Err(error) => {
                let kind = error.kind();
                let message = error.to_string();
                self.record_failure(session_id, &outcome.run_id, kind, &message)
                    .await;
                Err(GatewayError::Run { kind, message })
            }
        }
    }

    async fn mark_idle(&self, session: &mut Session) {
        session.status = SessionStatus::Idle;
        session.last_activity_at = Utc::now();
        if let Err(error) = self.store.save_session(session).await {
            tracing::error!(session_id = %session.session_id, %error, "failed to mark session idle");
        }
    }

    /// Forgets the session's lock once nobody holds or waits on it.
    fn release_lock(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn record_failure(&self, session_id: &str, run_id: &str, kind: ErrorKind, message: &str) {
        let failure = RunFailureRecord {
            session_id: session_id.to_owned(),
            run_id: run_id.to_owned(),
            kind,
            message: message.to_owned(),
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.record_run_failure(&failure).await {
            tracing::error!(session_id, run_id, %error, "failed to record run failure");
        }
    }

    async fn track_status(&self, session: &mut Session, payload: &StreamPayload) {
        let next = match payload {
            StreamPayload::ToolCall {
                status: ToolCallStatus::AwaitingApproval,
                ..
            } => SessionStatus::AwaitingApproval,
            StreamPayload::ToolResult { .. } if session.status == SessionStatus::AwaitingApproval => {
                SessionStatus::Running
            }
            _ => return,
        };
        if session.status == next {
            return;
        }
        session.status = next;
        session.last_activity_at = Utc::now();
        if let Err(error) = self.store.save_session(session).await {
            tracing::warn!(session_id = %session.session_id, %error, "failed to save session status");
        }
    }

    /// Fails when the session exists and belongs to someone else.
    async fn check_owner(
        &self,
        session_id: &str,
        principal_id: &str,
    ) -> Result<Option<Session>, GatewayError> {
        match self.store.load_session(session_id).await? {
            Some(session) if session.principal_id != principal_id => Err(GatewayError::Forbidden {
                principal_id: principal_id.to_owned(),
                session_id: session_id.to_owned(),
            }),
            session => Ok(session),
        }
    }

    async fn owned_session(&self, session_id: &str, principal_id: &str) -> Result<Session, GatewayError> {
        self.check_owner(session_id, principal_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }

    /// Checks the turn against the configured limits and returns the text
    /// stored as the user message.
    fn validate_turn(&self, request: &TurnRequest) -> Result<String, GatewayError> {
        if request.session_id.trim().is_empty() {
            return Err(GatewayError::validation("sessionId must not be empty"));
        }
        if request.principal_id.trim().is_empty() {
            return Err(GatewayError::validation("principalId must not be empty"));
        }
        let message = request.message.trim();
        if message.is_empty() {
            return Err(GatewayError::validation("message must not be empty"));
        }
        let chars = message.chars().count();
        if chars > self.settings.max_message_chars {
            return Err(GatewayError::validation(format!(
                "message has {chars} characters; the limit is {}",
                self.settings.max_message_chars
            )));
        }
        if request.attachments.len() > self.settings.max_attachments {
            return Err(GatewayError::validation(format!(
                "{} attachments sent; the limit is {}",
                request.attachments.len(),
                self.settings.max_attachments
            )));
        }

        let mut text = message.to_owned();
        for attachment in &request.attachments {
            let content_type = attachment
                .content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !self
                .settings
                .allowed_attachment_types
                .iter()
                .any(|allowed| *allowed == content_type)
            {
                return Err(GatewayError::validation(format!(
                    "attachment type `{}` is not allowed",
                    attachment.content_type
                )));
            }
            if attachment.content.len() > self.settings.max_attachment_bytes {
                return Err(GatewayError::validation(format!(
                    "attachment exceeds {} bytes",
                    self.settings.max_attachment_bytes
                )));
            }
            let name = attachment.name.as_deref().unwrap_or("unnamed");
            text.push_str(&format!("\n\n[attachment {name} ({content_type})]"));
            if content_type.starts_with("text/") {
                text.push('\n');
                text.push_str(&attachment.content);
            }
        }
        Ok(text)
    }
}
