use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tools::RECALL_MEMORY_TOOL_NAME;
use tracing::Instrument;
use types::{
    AgentConfig, ContentPart, Context, FunctionDecl, Message, MessageRole, ModelId, Provider,
    RuntimeError, StreamPayload, ToolCall, ToolCallRecord, ToolCallStatus, ToolContext,
    TranscriptMessage, UsageUpdate,
};

use crate::budget::{
    HeuristicTokenCounter, ModelLimits, TokenCounter, compute_max_completion_tokens,
};
use crate::provider_response::collect_response;
use crate::rate_limit::{OperationClass, RateLimiter};
use crate::retrieval::MemoryRetriever;
use crate::tool_execution::{ToolCallObserver, ToolExecutionEngine};

const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;
const NO_MEMORIES: &str = "No relevant memories found.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorState {
    Deciding,
    CallingModel,
    CallingTool { tools: Vec<String> },
    RetrievingMemory,
    AwaitingApproval,
    Done,
    Failed,
}

impl ExecutorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deciding => "deciding",
            Self::CallingModel => "calling_model",
            Self::CallingTool { .. } => "calling_tool",
            Self::RetrievingMemory => "retrieving_memory",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallingTool { tools } => write!(f, "calling_tool({})", tools.join(",")),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub model: ModelId,
    pub max_steps: usize,
    pub run_timeout: Duration,
    pub model_call_timeout: Duration,
    pub tool_concurrency: usize,
    pub stream_buffer_size: usize,
    pub requested_max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub recall_top_k: usize,
    pub recall_token_budget: u32,
}

impl ExecutorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            model: config.selection.model.clone(),
            max_steps: config.runtime.max_steps.max(1),
            run_timeout: Duration::from_secs(config.runtime.run_timeout_secs),
            model_call_timeout: Duration::from_secs(config.runtime.model_call_timeout_secs),
            tool_concurrency: config.runtime.tool_concurrency.max(1),
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            requested_max_tokens: config.budget.requested_max_tokens,
            system_prompt: config.runtime.system_prompt.clone(),
            recall_top_k: config.memory.retrieval.top_k.max(1),
            recall_token_budget: config.memory.retrieval.token_budget,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// Everything one run needs to know about the session it continues.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub session_id: String,
    pub principal_id: String,
    /// Stored transcript, ending with the user message that started the run.
    pub history: Vec<TranscriptMessage>,
    /// Sequence number for the first message this run produces.
    pub next_sequence: u64,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub messages: Vec<TranscriptMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub state_path: Vec<ExecutorState>,
    pub usage: UsageUpdate,
    pub model: ModelId,
    /// Final answer text on success.
    pub result: Result<Option<String>, RuntimeError>,
}

impl RunOutcome {
    pub fn final_state(&self) -> Option<&ExecutorState> {
        self.state_path.last()
    }
}

/// What the last model reply asked for that has not been handled yet.
#[derive(Debug, Default)]
struct PendingReply {
    content: Option<String>,
    recall_calls: Vec<ToolCall>,
    tool_calls: Vec<ToolCall>,
    requested_any: bool,
}

struct RunState {
    session_id: String,
    principal_id: String,
    messages: Vec<Message>,
    transcript: Vec<TranscriptMessage>,
    tool_calls: Vec<ToolCallRecord>,
    state_path: Vec<ExecutorState>,
    usage: UsageUpdate,
    next_sequence: u64,
    last_assistant_sequence: u64,
    reply: Option<PendingReply>,
    steps: usize,
}

impl RunState {
    fn enter(&mut self, state: ExecutorState) {
        tracing::debug!(state = %state, "executor transition");
        self.state_path.push(state);
    }
}

/// Forwards tool-call transitions as stream events and tracks when the tool
/// step is blocked on approvals.
struct EventObserver<'a> {
    events: &'a mpsc::Sender<StreamPayload>,
    step: ExecutorState,
    phase: Mutex<StepPhase>,
}

#[derive(Default)]
struct StepPhase {
    awaiting: HashSet<String>,
    path: Vec<ExecutorState>,
}

impl StepPhase {
    fn enter(&mut self, state: ExecutorState) {
        tracing::debug!(state = %state, "executor transition");
        self.path.push(state);
    }
}

impl EventObserver<'_> {
    fn phase(&self) -> MutexGuard<'_, StepPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The step waits while at least one call is awaiting approval and
    /// resumes when the last of them is decided.
    fn track_approval(&self, record: &ToolCallRecord) {
        let mut phase = self.phase();
        match record.status {
            ToolCallStatus::AwaitingApproval => {
                if phase.awaiting.is_empty() {
                    phase.enter(ExecutorState::AwaitingApproval);
                }
                phase.awaiting.insert(record.tool_call_id.clone());
            }
            ToolCallStatus::Executing | ToolCallStatus::Rejected => {
                if phase.awaiting.remove(&record.tool_call_id) && phase.awaiting.is_empty() {
                    phase.enter(self.step.clone());
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ToolCallObserver for EventObserver<'_> {
    async fn on_transition(&self, record: &ToolCallRecord) {
        self.track_approval(record);
        let payload = match record.status {
            ToolCallStatus::Pending | ToolCallStatus::AwaitingApproval => StreamPayload::ToolCall {
                tool_call_id: record.tool_call_id.clone(),
                name: record.tool_name.clone(),
                arguments: record.input.clone(),
                status: record.status,
            },
            ToolCallStatus::Executing => return,
            status => StreamPayload::ToolResult {
                tool_call_id: record.tool_call_id.clone(),
                name: record.tool_name.clone(),
                status,
                output: record.result.clone(),
                error: match status {
                    ToolCallStatus::Rejected => record.rejection_reason.clone(),
                    _ => record.error.as_ref().map(|error| error.message.clone()),
                },
            },
        };
        let _ = self.events.send(payload).await;
    }
}

/// Runs one agent turn as a small state machine over model calls, tool
/// calls and memory retrieval.
pub struct AgentGraphExecutor {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolExecutionEngine>,
    retriever: Option<Arc<MemoryRetriever>>,
    rate_limiter: Arc<RateLimiter>,
    limits: ModelLimits,
    token_counter: Arc<dyn TokenCounter>,
    settings: ExecutorSettings,
}

impl AgentGraphExecutor {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolExecutionEngine>,
        rate_limiter: Arc<RateLimiter>,
        limits: ModelLimits,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            retriever: None,
            rate_limiter,
            limits,
            token_counter: Arc::new(HeuristicTokenCounter),
            settings,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<MemoryRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = token_counter;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn tools(&self) -> &Arc<ToolExecutionEngine> {
        &self.tools
    }

    pub fn retriever(&self) -> Option<&Arc<MemoryRetriever>> {
        self.retriever.as_ref()
    }

    /// Executes the run and always ends with exactly one terminal event
    /// (`final` or `error`) on `events`.
    pub async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<StreamPayload>,
        cancellation: CancellationToken,
    ) -> RunOutcome {
        let RunRequest {
            run_id,
            session_id,
            principal_id,
            history,
            next_sequence,
        } = request;
        let span = tracing::info_span!("agent_run", %run_id, %session_id);

        let _ = events
            .send(StreamPayload::Started {
                session_id: session_id.clone(),
                run_id: run_id.clone(),
            })
            .await;

        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.settings.system_prompt {
            messages.push(Message::text(MessageRole::System, prompt.clone()));
        }
        messages.extend(history.iter().map(TranscriptMessage::to_provider_message));

        let mut run = RunState {
            session_id,
            principal_id,
            messages,
            transcript: Vec::new(),
            tool_calls: Vec::new(),
            state_path: Vec::new(),
            usage: UsageUpdate::default(),
            next_sequence,
            last_assistant_sequence: next_sequence,
            reply: None,
            steps: 0,
        };

        let result = self
            .drive(&mut run, &events, &cancellation)
            .instrument(span)
            .await;
        self.close_unresolved(&mut run);

        match &result {
            Ok(content) => {
                run.enter(ExecutorState::Done);
                tracing::info!(%run_id, steps = run.steps, "run finished");
                let _ = events
                    .send(StreamPayload::Final {
                        content: content.clone(),
                        usage: run.usage,
                        model: self.settings.model.clone(),
                    })
                    .await;
            }
            Err(error) => {
                run.enter(ExecutorState::Failed);
                tracing::warn!(%run_id, steps = run.steps, %error, "run failed");
                let _ = events
                    .send(StreamPayload::error(error.kind(), error.to_string()))
                    .await;
            }
        }

        RunOutcome {
            run_id,
            messages: run.transcript,
            tool_calls: run.tool_calls,
            state_path: run.state_path,
            usage: run.usage,
            model: self.settings.model.clone(),
            result,
        }
    }

    async fn drive(
        &self,
        run: &mut RunState,
        events: &mpsc::Sender<StreamPayload>,
        cancellation: &CancellationToken,
    ) -> Result<Option<String>, RuntimeError> {
        let deadline = Instant::now() + self.settings.run_timeout;
        loop {
            run.enter(ExecutorState::Deciding);
            if cancellation.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::DeadlineExceeded {
                    timeout_ms: duration_ms(self.settings.run_timeout),
                });
            }

            let next = match &run.reply {
                None => ExecutorState::CallingModel,
                Some(reply) if !reply.recall_calls.is_empty() => ExecutorState::RetrievingMemory,
                Some(reply) if !reply.tool_calls.is_empty() => ExecutorState::CallingTool {
                    tools: reply.tool_calls.iter().map(|call| call.name.clone()).collect(),
                },
                Some(reply) if !reply.requested_any => {
                    return Ok(reply.content.clone());
                }
                Some(_) => ExecutorState::CallingModel,
            };

            run.steps += 1;
            if run.steps > self.settings.max_steps {
                return Err(RuntimeError::StepBudgetExceeded {
                    max_steps: self.settings.max_steps,
                });
            }
            run.enter(next.clone());
            match next {
                ExecutorState::CallingModel => {
                    self.call_model(run, events, cancellation, deadline).await?;
                }
                ExecutorState::RetrievingMemory => self.retrieve_memory(run, events).await,
                ExecutorState::CallingTool { .. } => {
                    self.call_tools(run, events, cancellation).await;
                }
                _ => {}
            }
        }
    }

    async fn call_model(
        &self,
        run: &mut RunState,
        events: &mpsc::Sender<StreamPayload>,
        cancellation: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        let context = self.build_context(run);
        let mut attempt = 0_u32;
        let response = loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let limit = remaining.min(self.settings.model_call_timeout);
            let mut emitted = false;
            let outcome = tokio::select! {
                _ = cancellation.cancelled() => return Err(RuntimeError::Cancelled),
                timed = tokio::time::timeout(
                    limit,
                    collect_response(
                        self.provider.as_ref(),
                        &context,
                        self.settings.stream_buffer_size,
                        events,
                        &mut emitted,
                    ),
                ) => timed,
            };
            match outcome {
                Ok(response) => break response?,
                Err(_) if limit < self.settings.model_call_timeout => {
                    return Err(RuntimeError::DeadlineExceeded {
                        timeout_ms: duration_ms(self.settings.run_timeout),
                    });
                }
                Err(_) if attempt == 1 && !emitted => {
                    tracing::warn!(
                        model = %context.model,
                        timeout_ms = duration_ms(limit),
                        "model call timed out before producing output; retrying once"
                    );
                }
                Err(_) => {
                    return Err(RuntimeError::ModelTimeout {
                        timeout_ms: duration_ms(self.settings.model_call_timeout),
                    });
                }
            }
        };

        if let Some(usage) = &response.usage {
            run.usage.merge(usage);
        }
        let mut message = response.message;
        if message.tool_calls.is_empty() {
            message.tool_calls = response.tool_calls;
        }

        let mut parts = Vec::new();
        if let Some(text) = message.content.clone().filter(|text| !text.is_empty()) {
            parts.push(ContentPart::Text { text });
        }
        for call in &message.tool_calls {
            parts.push(ContentPart::ToolCallRequest {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        run.last_assistant_sequence = self.append_transcript(run, MessageRole::Assistant, parts);

        let (recall_calls, tool_calls): (Vec<_>, Vec<_>) = message
            .tool_calls
            .iter()
            .cloned()
            .partition(|call| self.retriever.is_some() && call.name == RECALL_MEMORY_TOOL_NAME);
        run.reply = Some(PendingReply {
            content: message.content.clone(),
            requested_any: !message.tool_calls.is_empty(),
            recall_calls,
            tool_calls,
        });
        run.messages.push(message);
        Ok(())
    }

    fn build_context(&self, run: &RunState) -> Context {
        let mut tools = self.tools.registry().schemas();
        if self.retriever.is_some() {
            tools.push(recall_memory_decl());
        }
        let model = self.settings.model.clone();
        let mut prompt = self
            .token_counter
            .count_messages(&model, &run.messages)
            .tokens;
        for decl in &tools {
            let encoded = serde_json::to_string(decl).unwrap_or_default();
            prompt = prompt.saturating_add(self.token_counter.count(&model, &encoded).tokens);
        }
        let budget = compute_max_completion_tokens(
            prompt,
            self.limits.context_limit(&model),
            self.settings.requested_max_tokens,
        );
        if !budget.reasons.is_empty() {
            tracing::debug!(
                prompt_tokens = prompt,
                max_tokens = budget.max_tokens,
                reasons = ?budget.reasons,
                "completion budget clamped"
            );
        }
        Context {
            provider: self.provider.provider_id().clone(),
            model,
            tools,
            messages: run.messages.clone(),
            max_tokens: Some(budget.max_tokens),
        }
    }

    async fn retrieve_memory(&self, run: &mut RunState, events: &mpsc::Sender<StreamPayload>) {
        let calls = run
            .reply
            .as_mut()
            .map(|reply| std::mem::take(&mut reply.recall_calls))
            .unwrap_or_default();
        let Some(retriever) = &self.retriever else {
            return;
        };

        for call in calls {
            let query = recall_query(&call.arguments);
            let k = call
                .arguments
                .get("k")
                .and_then(Value::as_u64)
                .map(|k| (k as usize).clamp(1, self.settings.recall_top_k))
                .unwrap_or(self.settings.recall_top_k);

            let decision = self
                .rate_limiter
                .check(&run.principal_id, OperationClass::MemoryRead)
                .await;
            let mut parts = Vec::new();
            let (output, is_error) = if !decision.allowed {
                (
                    format!(
                        "Memory retrieval is rate limited; retry after {}ms.",
                        decision.retry_after_ms
                    ),
                    true,
                )
            } else {
                match retriever
                    .retrieve(&run.principal_id, &query, k, self.settings.recall_token_budget)
                    .await
                {
                    Ok(retrieval) if retrieval.records.is_empty() => (NO_MEMORIES.to_owned(), false),
                    Ok(retrieval) => {
                        let mut lines = vec!["Relevant memories:".to_owned()];
                        for hit in &retrieval.records {
                            lines.push(format!("- [{}] {}", hit.record.record_id, hit.record.content));
                            parts.push(ContentPart::MemoryCitation {
                                record_id: hit.record.record_id.clone(),
                                excerpt: hit.record.content.clone(),
                            });
                            let _ = events
                                .send(StreamPayload::Citation {
                                    record_id: hit.record.record_id.clone(),
                                    excerpt: hit.record.content.clone(),
                                    score: hit.score,
                                })
                                .await;
                        }
                        (lines.join("\n"), false)
                    }
                    Err(error) => {
                        tracing::warn!(%error, "memory retrieval failed");
                        (format!("Memory retrieval failed: {error}"), true)
                    }
                }
            };

            // The result part precedes citations so replayed history maps it
            // back onto the requesting call.
            parts.insert(
                0,
                ContentPart::ToolCallResult {
                    tool_call_id: call.id.clone(),
                    output: output.clone(),
                    is_error,
                },
            );
            self.append_transcript(run, MessageRole::Tool, parts);
            run.messages.push(Message {
                role: MessageRole::Tool,
                content: Some(output),
                tool_calls: Vec::new(),
                tool_call_id: Some(call.id),
            });
        }
    }

    async fn call_tools(
        &self,
        run: &mut RunState,
        events: &mpsc::Sender<StreamPayload>,
        cancellation: &CancellationToken,
    ) {
        let calls = run
            .reply
            .as_mut()
            .map(|reply| std::mem::take(&mut reply.tool_calls))
            .unwrap_or_default();
        let observer = EventObserver {
            events,
            step: ExecutorState::CallingTool {
                tools: calls.iter().map(|call| call.name.clone()).collect(),
            },
            phase: Mutex::new(StepPhase {
                awaiting: HashSet::new(),
                path: std::mem::take(&mut run.state_path),
            }),
        };
        let context = ToolContext::new(run.principal_id.clone(), run.session_id.clone());

        let mut pending = Vec::with_capacity(calls.len());
        for call in &calls {
            let record = ToolCallRecord::pending(&run.session_id, run.last_assistant_sequence, call);
            observer.on_transition(&record).await;
            pending.push(record);
        }

        let engine = self.tools.as_ref();
        let observer_ref = &observer;
        let context_ref = &context;
        let mut finished = futures::stream::iter(pending.into_iter().enumerate().map(
            |(index, record)| async move {
                let record = engine
                    .execute(record, context_ref, observer_ref, cancellation)
                    .await;
                (index, record)
            },
        ))
        .buffer_unordered(self.settings.tool_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
        finished.sort_by_key(|(index, _)| *index);
        run.state_path = std::mem::take(&mut observer.phase().path);

        for (_, record) in finished {
            let feedback = record.model_feedback();
            self.append_transcript(
                run,
                MessageRole::Tool,
                vec![ContentPart::ToolCallResult {
                    tool_call_id: record.tool_call_id.clone(),
                    output: feedback.clone(),
                    is_error: record.status != ToolCallStatus::Succeeded,
                }],
            );
            run.messages.push(Message {
                role: MessageRole::Tool,
                content: Some(feedback),
                tool_calls: Vec::new(),
                tool_call_id: Some(record.tool_call_id.clone()),
            });
            run.tool_calls.push(record);
        }
    }

    /// Answers calls the run will never execute so the stored transcript
    /// stays replayable.
    fn close_unresolved(&self, run: &mut RunState) {
        let Some(reply) = run.reply.take() else {
            return;
        };
        for call in reply.recall_calls.into_iter().chain(reply.tool_calls) {
            let output = "Tool call was not executed because the run ended.".to_owned();
            self.append_transcript(
                run,
                MessageRole::Tool,
                vec![ContentPart::ToolCallResult {
                    tool_call_id: call.id.clone(),
                    output,
                    is_error: true,
                }],
            );
        }
    }

    fn append_transcript(
        &self,
        run: &mut RunState,
        role: MessageRole,
        parts: Vec<ContentPart>,
    ) -> u64 {
        let sequence = run.next_sequence;
        run.next_sequence += 1;
        let mut message = TranscriptMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: run.session_id.clone(),
            sequence,
            role,
            parts,
            created_at: Utc::now(),
            token_count: 0,
        };
        message.token_count = self
            .token_counter
            .count_messages(&self.settings.model, &[message.to_provider_message()])
            .tokens;
        run.transcript.push(message);
        sequence
    }
}

/// Declaration of the reserved directive the model uses to ask for memory.
pub fn recall_memory_decl() -> FunctionDecl {
    FunctionDecl::new(
        RECALL_MEMORY_TOOL_NAME,
        Some("Search the user's long-term memory for facts relevant to the conversation.".to_owned()),
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": { "type": "string", "minLength": 1 },
                "k": { "type": "integer", "minimum": 1 }
            }
        }),
    )
}

fn recall_query(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
