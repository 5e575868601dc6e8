use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use memory::{HashingEmbedder, InMemoryStore};
use mockall::mock;
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, advance, sleep},
};
use tokio_util::sync::CancellationToken;
use tools::{MemoryWriter, ToolRegistry};
use types::{
    BudgetConfig, ContentPart, Context, ErrorKind, FunctionDecl, MemoryError, MemoryRecord,
    MemoryStore, MessageRole,
    ModelCatalog, ModelDescriptor, ModelId, Provider, ProviderCaps, ProviderError,
    ProviderId, Response, RuntimeError, SafetyTier, ScoredMemory, Session, StreamItem,
    StreamPayload, Tool, ToolCall, ToolCallDelta, ToolCallRecord, ToolCallStatus, ToolContext,
    ToolError, TranscriptMessage, TranscriptStore, UsageUpdate,
};

use super::*;
use crate::retrieval::rank_for_test;

const MODEL: &str = "gpt-4o-mini";
const SESSION: &str = "session-1";
const PRINCIPAL: &str = "alice";

mock! {
    Backend {}
    #[async_trait]
    impl RateLimitBackend for Backend {
        async fn record(
            &self,
            key: &RateKey,
            budget: RateBudget,
            now: Instant,
        ) -> Result<RateDecision, RateLimitError>;
        fn purge_idle(&self, now: Instant, budgets: &RateBudgets) -> usize;
    }
}

mock! {
    ToolContract {}
    #[async_trait]
    impl Tool for ToolContract {
        fn schema(&self) -> FunctionDecl;
        async fn execute(&self, args: &str, context: &ToolContext) -> Result<String, ToolError>;
        fn timeout(&self) -> Duration;
        fn safety_tier(&self) -> SafetyTier;
    }
}

#[derive(Debug)]
enum ProviderStep {
    Stream(Vec<StreamItem>),
    Fail(ProviderError),
    Hang,
}

struct ScriptedProvider {
    provider_id: ProviderId,
    catalog: ModelCatalog,
    steps: Mutex<VecDeque<ProviderStep>>,
    contexts: Mutex<Vec<Context>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<ProviderStep>) -> Self {
        let provider_id = ProviderId::from("openai");
        Self {
            catalog: ModelCatalog {
                models: vec![ModelDescriptor {
                    provider: provider_id.clone(),
                    model: ModelId::from(MODEL),
                    display_name: None,
                    caps: ProviderCaps {
                        supports_streaming: true,
                        supports_tools: true,
                        max_context_tokens: Some(128_000),
                        max_output_tokens: None,
                    },
                }],
            },
            provider_id,
            steps: Mutex::new(steps.into()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn contexts(&self) -> Vec<Context> {
        self.contexts
            .lock()
            .expect("context log should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    fn model_catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    async fn complete(&self, _context: &Context) -> Result<Response, ProviderError> {
        Err(ProviderError::RequestFailed {
            provider: self.provider_id.clone(),
            message: "scripted provider only streams".to_owned(),
        })
    }

    async fn stream(
        &self,
        context: &Context,
        _buffer_size: usize,
    ) -> Result<types::ProviderStream, ProviderError> {
        self.contexts
            .lock()
            .expect("context log should not be poisoned")
            .push(context.clone());
        let step = self
            .steps
            .lock()
            .expect("step queue should not be poisoned")
            .pop_front()
            .expect("scripted provider expected another step");
        match step {
            ProviderStep::Stream(items) => {
                let (sender, receiver) = mpsc::channel(items.len().max(1));
                for item in items {
                    sender
                        .try_send(Ok(item))
                        .expect("scripted stream should accept item");
                }
                Ok(receiver)
            }
            ProviderStep::Fail(error) => Err(error),
            ProviderStep::Hang => {
                sleep(Duration::from_secs(3_600)).await;
                Err(ProviderError::Transport {
                    provider: self.provider_id.clone(),
                    message: "hung".to_owned(),
                })
            }
        }
    }
}

fn tool_call_item(index: usize, id: &str, name: &str, arguments: &str) -> StreamItem {
    StreamItem::ToolCallDelta(ToolCallDelta {
        index,
        id: Some(id.to_owned()),
        name: Some(name.to_owned()),
        arguments: Some(arguments.to_owned()),
    })
}

fn usage(prompt: u64, completion: u64) -> StreamItem {
    StreamItem::UsageUpdate(UsageUpdate {
        prompt_tokens: Some(prompt),
        completion_tokens: Some(completion),
        total_tokens: Some(prompt + completion),
    })
}

struct SearchFlights {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl SearchFlights {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                delay: Duration::ZERO,
            },
            calls,
        )
    }
}

#[async_trait]
impl Tool for SearchFlights {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new(
            "search_flights",
            Some("Search scheduled flights".to_owned()),
            json!({
                "type": "object",
                "required": ["origin", "destination"],
                "properties": {
                    "origin": { "type": "string", "minLength": 3 },
                    "destination": { "type": "string", "minLength": 3 }
                }
            }),
        )
    }

    async fn execute(&self, args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let parsed: Value = serde_json::from_str(args)?;
        Ok(json!({
            "origin": parsed["origin"],
            "flights": ["UA100", "DL200"]
        })
        .to_string())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::ReadOnly
    }
}

/// Fails with a transient error a fixed number of times, then succeeds.
struct FlakyLookup {
    failures_left: AtomicU32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for FlakyLookup {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new("flaky_lookup", None, json!({ "type": "object" }))
    }

    async fn execute(&self, _args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(ToolError::Transient {
                tool: "flaky_lookup".to_owned(),
                message: "upstream 503".to_owned(),
            });
        }
        Ok("looked up".to_owned())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::SideEffecting
    }
}

struct AirportLookup {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for AirportLookup {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new(
            "airport_lookup",
            None,
            json!({
                "type": "object",
                "required": ["city"],
                "properties": { "city": { "type": "string" } }
            }),
        )
    }

    async fn execute(&self, _args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("SFO (lookup #{call})"))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::ReadOnly
    }

    fn cache_ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}

/// Cancels the run it belongs to from inside its first execution.
struct CancellingLookup {
    cancellation: CancellationToken,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CancellingLookup {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new("seat_map", None, json!({ "type": "object" }))
    }

    async fn execute(&self, _args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancellation.cancel();
        Ok("rows 1-30".to_owned())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::ReadOnly
    }
}

/// Serves vector searches from a snapshot taken before it stalls, so a write
/// can land while a retrieval is still in flight.
struct StallingStore {
    inner: Arc<InMemoryStore>,
    stalled: Mutex<Option<oneshot::Sender<()>>>,
    resume: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl MemoryStore for StallingStore {
    async fn insert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        self.inner.insert(record).await
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        embedding: &[f32],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        let snapshot = self.inner.vector_search(owner_id, embedding, limit, now).await;
        let stalled = self.stalled.lock().expect("stall lock").take();
        if let Some(stalled) = stalled {
            let _ = stalled.send(());
            let resume = self.resume.lock().await.take();
            if let Some(resume) = resume {
                let _ = resume.await;
            }
        }
        snapshot
    }

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        self.inner.keyword_search(owner_id, query, limit, now).await
    }
}

/// `output` of `None` makes every attempt fail with a transient error.
fn booking_tool(output: Option<&'static str>, expected_calls: usize) -> MockToolContract {
    let mut tool = MockToolContract::new();
    tool.expect_schema().return_const(FunctionDecl::new(
        "book_flight",
        Some("Purchase a ticket".to_owned()),
        json!({
            "type": "object",
            "required": ["flight"],
            "properties": { "flight": { "type": "string" } }
        }),
    ));
    tool.expect_timeout().return_const(Duration::from_secs(5));
    tool.expect_safety_tier().return_const(SafetyTier::Sensitive);
    tool.expect_execute()
        .times(expected_calls)
        .returning(move |_, _| match output {
            Some(output) => Ok(output.to_owned()),
            None => Err(ToolError::Transient {
                tool: "book_flight".to_owned(),
                message: "payment gateway 503".to_owned(),
            }),
        });
    tool
}

#[derive(Default)]
struct RecordingObserver {
    statuses: Mutex<Vec<ToolCallStatus>>,
}

impl RecordingObserver {
    fn statuses(&self) -> Vec<ToolCallStatus> {
        self.statuses
            .lock()
            .expect("observer log should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl ToolCallObserver for RecordingObserver {
    async fn on_transition(&self, record: &ToolCallRecord) {
        self.statuses
            .lock()
            .expect("observer log should not be poisoned")
            .push(record.status);
    }
}

fn fast_retry() -> provider::RetryPolicy {
    provider::RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(4),
        jitter: false,
    }
}

fn engine_with(registry: ToolRegistry, budgets: RateBudgets) -> Arc<ToolExecutionEngine> {
    Arc::new(
        ToolExecutionEngine::new(
            Arc::new(registry),
            Arc::new(RateLimiter::new(budgets)),
            Arc::new(ApprovalRegistry::new()),
        )
        .with_retry_policy(fast_retry())
        .with_approval_timeout(Duration::from_secs(5)),
    )
}

fn pending_record(id: &str, name: &str, arguments: Value) -> ToolCallRecord {
    ToolCallRecord::pending(
        SESSION,
        2,
        &ToolCall {
            id: id.to_owned(),
            name: name.to_owned(),
            arguments,
        },
    )
}

fn tool_context() -> ToolContext {
    ToolContext::new(PRINCIPAL, SESSION)
}

async fn wait_for_pending_approval(approvals: &ApprovalRegistry) -> String {
    loop {
        if let Some(id) = approvals.pending_for(SESSION).into_iter().next() {
            return id;
        }
        tokio::task::yield_now().await;
    }
}

fn memory_record(id: &str, owner: &str, content: &str, created_second: u32) -> MemoryRecord {
    MemoryRecord {
        record_id: id.to_owned(),
        owner_id: owner.to_owned(),
        content: content.to_owned(),
        embedding: Vec::new(),
        category: None,
        created_at: Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, created_second)
            .single()
            .expect("timestamp should be valid"),
        expires_at: None,
    }
}

fn scored(id: &str, score: f64, created_second: u32) -> ScoredMemory {
    ScoredMemory {
        record: memory_record(id, PRINCIPAL, id, created_second),
        score,
    }
}

fn retriever_over(store: Arc<InMemoryStore>) -> MemoryRetriever {
    MemoryRetriever::new(
        store,
        Arc::new(HashingEmbedder::default()),
        RetrieverSettings::default(),
    )
}

fn executor_with(
    provider: Arc<ScriptedProvider>,
    engine: Arc<ToolExecutionEngine>,
    settings: ExecutorSettings,
) -> AgentGraphExecutor {
    AgentGraphExecutor::new(
        provider,
        engine,
        Arc::new(RateLimiter::new(RateBudgets::default())),
        ModelLimits::new(8_192).with_window(MODEL, 128_000),
        settings,
    )
}

fn user_turn(sequence: u64, text: &str) -> TranscriptMessage {
    TranscriptMessage {
        message_id: format!("user-{sequence}"),
        session_id: SESSION.to_owned(),
        sequence,
        role: MessageRole::User,
        parts: vec![ContentPart::Text {
            text: text.to_owned(),
        }],
        created_at: Utc::now(),
        token_count: 0,
    }
}

fn run_request(text: &str) -> RunRequest {
    RunRequest {
        run_id: "run-1".to_owned(),
        session_id: SESSION.to_owned(),
        principal_id: PRINCIPAL.to_owned(),
        history: vec![user_turn(1, text)],
        next_sequence: 2,
    }
}

fn drain(receiver: &mut mpsc::Receiver<StreamPayload>) -> Vec<StreamPayload> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn event_types(events: &[StreamPayload]) -> Vec<&'static str> {
    events.iter().map(StreamPayload::event_type).collect()
}

// Token budget

#[test]
fn completion_budget_clamps_to_the_model_window() {
    let budget = compute_max_completion_tokens(100, 128_000, Some(200_000));
    assert_eq!(budget.max_tokens, 127_900);
    assert_eq!(budget.reasons, vec![CLAMPED_MODEL_LIMIT]);

    let budget = compute_max_completion_tokens(100, 128_000, Some(4_000));
    assert_eq!(budget.max_tokens, 4_000);
    assert!(budget.reasons.is_empty());
}

#[test]
fn completion_budget_never_drops_below_one_token() {
    let budget = compute_max_completion_tokens(130_000, 128_000, None);
    assert_eq!(budget.max_tokens, 1);

    let budget = compute_max_completion_tokens(1_000, 8_192, Some(0));
    assert_eq!(budget.max_tokens, 7_192);
    assert_eq!(budget.reasons, vec![CLAMPED_INVALID_REQUEST]);
}

#[test]
fn heuristic_counter_uses_model_family_ratios() {
    let counter = HeuristicTokenCounter;
    let claude = ModelId::from("claude-sonnet");
    let estimate = counter.count(&claude, &"a".repeat(35));
    assert_eq!(estimate.tokens, 10);
    assert!(estimate.approximate);
    assert_eq!(ModelFamily::of(&ModelId::from("gpt-4o")), ModelFamily::OpenAi);
    assert_eq!(ModelFamily::of(&ModelId::from("llama-3")), ModelFamily::Other);

    let messages = vec![types::Message::text(MessageRole::User, "a".repeat(35))];
    let estimate = counter.count_messages(&claude, &messages);
    assert_eq!(estimate.tokens, 14);
    assert!(estimate.approximate);
}

#[test]
fn model_limits_prefer_config_overrides_over_catalog() {
    let provider = ScriptedProvider::new(Vec::new());
    let mut config = BudgetConfig::default();
    let limits = ModelLimits::from_catalog(provider.model_catalog(), &config);
    assert_eq!(limits.context_limit(&ModelId::from(MODEL)), 128_000);
    assert_eq!(
        limits.context_limit(&ModelId::from("unknown")),
        config.fallback_context_tokens
    );

    config.context_windows.insert(MODEL.to_owned(), 64_000);
    let limits = ModelLimits::from_catalog(provider.model_catalog(), &config);
    assert_eq!(limits.context_limit(&ModelId::from(MODEL)), 64_000);
}

// Rate limiting

fn tight_budgets(limit: u32) -> RateBudgets {
    let budget = RateBudget {
        limit,
        window: Duration::from_secs(60),
    };
    RateBudgets {
        stream_start: budget,
        tool_invocation: budget,
        memory_write: budget,
        memory_read: budget,
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_denies_the_request_after_the_budget_and_recovers() {
    let limiter = RateLimiter::new(tight_budgets(3));
    for expected_remaining in [2, 1, 0] {
        let decision = limiter.check(PRINCIPAL, OperationClass::StreamStart).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }

    advance(Duration::from_secs(10)).await;
    let denied = limiter.check(PRINCIPAL, OperationClass::StreamStart).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_ms, 50_000);

    let other_principal = limiter.check("bob", OperationClass::StreamStart).await;
    assert!(other_principal.allowed);
    let other_operation = limiter.check(PRINCIPAL, OperationClass::MemoryRead).await;
    assert!(other_operation.allowed);

    advance(Duration::from_secs(50)).await;
    let recovered = limiter.check(PRINCIPAL, OperationClass::StreamStart).await;
    assert!(recovered.allowed);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_purges_idle_buckets() {
    let backend = Arc::new(InProcessRateLimitBackend::new());
    let limiter = RateLimiter::with_backend(tight_budgets(5), backend.clone());
    limiter.check(PRINCIPAL, OperationClass::ToolInvocation).await;
    limiter.check("bob", OperationClass::MemoryWrite).await;
    assert_eq!(backend.bucket_count(), 2);

    advance(Duration::from_secs(61)).await;
    assert_eq!(limiter.purge_idle(), 2);
    assert_eq!(backend.bucket_count(), 0);
}

#[tokio::test]
async fn rate_limiter_fails_open_only_for_reads_when_backend_is_down() {
    let mut backend = MockBackend::new();
    backend.expect_record().returning(|_, _, _| {
        Err(RateLimitError::Backend {
            message: "connection refused".to_owned(),
        })
    });
    let limiter = RateLimiter::with_backend(RateBudgets::default(), Arc::new(backend));

    let read = limiter.check(PRINCIPAL, OperationClass::MemoryRead).await;
    assert!(read.allowed);

    let write = limiter.check(PRINCIPAL, OperationClass::MemoryWrite).await;
    assert!(!write.allowed);
    assert_eq!(write.retry_after_ms, 1_000);
}

#[tokio::test]
async fn read_only_tool_calls_fail_open_when_the_rate_backend_is_down() {
    let mut backend = MockBackend::new();
    backend.expect_record().returning(|_, _, _| {
        Err(RateLimitError::Backend {
            message: "connection refused".to_owned(),
        })
    });
    let (search, searches) = SearchFlights::new();
    let lookups = Arc::new(AtomicU32::new(0));
    let registry = ToolRegistry::builder()
        .register(search)
        .register(FlakyLookup {
            failures_left: AtomicU32::new(0),
            calls: lookups.clone(),
        })
        .build()
        .expect("registry should build");
    let engine = ToolExecutionEngine::new(
        Arc::new(registry),
        Arc::new(RateLimiter::with_backend(RateBudgets::default(), Arc::new(backend))),
        Arc::new(ApprovalRegistry::new()),
    );

    let read = engine
        .execute(
            pending_record("call-1", "search_flights", json!({ "origin": "SFO", "destination": "JFK" })),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(read.status, ToolCallStatus::Succeeded);
    assert_eq!(searches.load(Ordering::SeqCst), 1);

    let write = engine
        .execute(
            pending_record("call-2", "flaky_lookup", json!({})),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(write.status, ToolCallStatus::Failed);
    assert_eq!(
        write.error.expect("denial should be recorded").kind,
        ErrorKind::RateLimited
    );
    assert_eq!(lookups.load(Ordering::SeqCst), 0);
}

// Result cache

#[test]
fn cache_keys_ignore_whitespace_and_key_order_but_keep_case() {
    let first = CacheKey::from_parts(
        "memory:alice",
        &json!({ "query": "Flights to  Tokyo", "k": 8 }),
    )
    .expect("key should encode");
    let second = CacheKey::from_parts(
        "memory:alice",
        &json!({ "k": 8, "query": "  Flights to Tokyo\n" }),
    )
    .expect("key should encode");
    let other = CacheKey::from_parts("memory:alice", &json!({ "query": "flights to osaka", "k": 8 }))
        .expect("key should encode");

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert!(first.as_str().starts_with("memory:alice:"));

    let upper = CacheKey::from_parts("tool:confirmation", &json!({ "code": "ABC123" }))
        .expect("key should encode");
    let lower = CacheKey::from_parts("tool:confirmation", &json!({ "code": "abc123" }))
        .expect("key should encode");
    assert_ne!(upper, lower);
}

#[tokio::test(start_paused = true)]
async fn cache_entries_expire_and_invalidate_by_tag() {
    let cache = ResultCache::<String>::new();
    let tag = vec!["memory:alice".to_owned()];
    let key = CacheKey::from_parts("memory:alice", &json!({ "q": 1 })).expect("key");
    let other = CacheKey::from_parts("memory:alice", &json!({ "q": 2 })).expect("key");

    cache.insert(key.clone(), "one".to_owned(), Duration::from_secs(30), &tag);
    cache.insert(other.clone(), "two".to_owned(), Duration::from_secs(90), &tag);
    assert_eq!(cache.get(&key).as_deref(), Some("one"));

    advance(Duration::from_secs(31)).await;
    assert_eq!(cache.get(&key), None);
    assert_eq!(cache.get(&other).as_deref(), Some("two"));

    assert_eq!(cache.invalidate_tag("memory:alice"), 1);
    assert!(cache.is_empty());
    assert_eq!(cache.invalidate_tag("memory:alice"), 0);
}

#[tokio::test]
async fn cache_get_or_compute_reports_hits_and_skips_errors() {
    let cache = ResultCache::<u32>::new();
    let key = CacheKey::from_parts("tool:x", &json!({})).expect("key");

    let failed: Result<(u32, bool), &str> = cache
        .get_or_compute(key.clone(), Duration::from_secs(60), &[], || async {
            Err("boom")
        })
        .await;
    assert!(failed.is_err());
    assert!(cache.is_empty());

    let (value, hit) = cache
        .get_or_compute(key.clone(), Duration::from_secs(60), &[], || async {
            Ok::<_, &str>(7)
        })
        .await
        .expect("compute should succeed");
    assert_eq!((value, hit), (7, false));

    let (value, hit) = cache
        .get_or_compute(key, Duration::from_secs(60), &[], || async { Ok::<_, &str>(9) })
        .await
        .expect("cached value should be returned");
    assert_eq!((value, hit), (7, true));
}

#[tokio::test]
async fn cache_skips_values_computed_across_a_tag_invalidation() {
    let cache = ResultCache::<u32>::new();
    let tags = vec!["memory:alice".to_owned()];
    let key = CacheKey::from_parts("memory:alice", &json!({ "q": "aisle" })).expect("key");

    let (value, hit) = cache
        .get_or_compute(key.clone(), Duration::from_secs(60), &tags, || async {
            cache.invalidate_tag("memory:alice");
            Ok::<_, &str>(1)
        })
        .await
        .expect("compute should succeed");
    assert_eq!((value, hit), (1, false));
    assert!(cache.is_empty());

    let (value, hit) = cache
        .get_or_compute(key.clone(), Duration::from_secs(60), &tags, || async {
            Ok::<_, &str>(2)
        })
        .await
        .expect("compute should succeed");
    assert_eq!((value, hit), (2, false));
    assert_eq!(cache.get(&key), Some(2));
}

// Memory retrieval

#[test]
fn weighted_fusion_and_reciprocal_rank_fusion_rank_differently() {
    let vector = vec![scored("a", 0.9, 1), scored("b", 0.5, 1)];
    let keyword = vec![scored("b", 2.0, 1)];

    let weighted = rank_for_test(&WeightedFusion::default(), vector.clone(), keyword.clone());
    let ids = weighted
        .iter()
        .map(|hit| hit.record.record_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["a", "b"]);
    assert!((weighted[0].score - 0.7).abs() < 1e-9);
    assert!((weighted[1].score - 0.3).abs() < 1e-9);

    let rrf = rank_for_test(&ReciprocalRankFusion::default(), vector, keyword);
    let ids = rrf
        .iter()
        .map(|hit| hit.record.record_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["b", "a"]);
}

#[test]
fn fusion_ties_prefer_newer_records_then_record_id() {
    let vector = vec![scored("older", 0.4, 1), scored("newer", 0.4, 9), scored("also-older", 0.4, 1)];
    let ranked = rank_for_test(&WeightedFusion::default(), vector, Vec::new());
    let ids = ranked
        .iter()
        .map(|hit| hit.record.record_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["newer", "also-older", "older"]);
}

#[tokio::test]
async fn retrieval_only_returns_the_callers_memories() {
    let store = Arc::new(InMemoryStore::new());
    let retriever = retriever_over(store.clone());
    retriever
        .remember(PRINCIPAL, "Alice prefers aisle seats", Some("preference"))
        .await
        .expect("alice memory should store");
    retriever
        .remember("bob", "Bob prefers aisle seats near the wing", None)
        .await
        .expect("bob memory should store");

    let retrieval = retriever
        .retrieve(PRINCIPAL, "aisle seats", 8, 1_024)
        .await
        .expect("retrieval should succeed");
    assert!(!retrieval.records.is_empty());
    assert!(
        retrieval
            .records
            .iter()
            .all(|hit| hit.record.owner_id == PRINCIPAL)
    );
    assert!(retrieval.records.iter().all(|hit| (0.0..=1.0).contains(&hit.score)));
}

#[tokio::test]
async fn retrieval_cache_survives_whitespace_variants_until_a_write() {
    let store = Arc::new(InMemoryStore::new());
    let retriever = retriever_over(store);
    retriever
        .remember(PRINCIPAL, "Window seat on long haul flights", None)
        .await
        .expect("memory should store");

    let first = retriever
        .retrieve(PRINCIPAL, "window seat", 4, 512)
        .await
        .expect("retrieval should succeed");
    assert!(!first.used_cache);
    let second = retriever
        .retrieve(PRINCIPAL, "  Window\tSEAT ", 4, 512)
        .await
        .expect("retrieval should succeed");
    assert!(second.used_cache);
    assert_eq!(first.records, second.records);

    let bob = retriever
        .retrieve("bob", "window seat", 4, 512)
        .await
        .expect("bob retrieval should succeed");
    assert!(!bob.used_cache);
    assert!(bob.records.is_empty());

    retriever
        .remember(PRINCIPAL, "Window seat, but never the last row", None)
        .await
        .expect("second memory should store");
    let after_write = retriever
        .retrieve(PRINCIPAL, "window seat", 4, 512)
        .await
        .expect("retrieval should succeed");
    assert!(!after_write.used_cache);
    assert_eq!(after_write.records.len(), 2);
}

#[tokio::test]
async fn retrieval_racing_a_write_is_not_cached() {
    let inner = Arc::new(InMemoryStore::new());
    let (stalled_tx, stalled_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel();
    let store = Arc::new(StallingStore {
        inner,
        stalled: Mutex::new(Some(stalled_tx)),
        resume: tokio::sync::Mutex::new(Some(resume_rx)),
    });
    let retriever = Arc::new(MemoryRetriever::new(
        store,
        Arc::new(HashingEmbedder::default()),
        RetrieverSettings::default(),
    ));
    retriever
        .remember(PRINCIPAL, "Window seat on long haul flights", None)
        .await
        .expect("memory should store");

    let in_flight = {
        let retriever = retriever.clone();
        tokio::spawn(async move { retriever.retrieve(PRINCIPAL, "window seat", 4, 512).await })
    };
    stalled_rx.await.expect("retrieval should reach the store");
    retriever
        .remember(PRINCIPAL, "Window seat, but never the last row", None)
        .await
        .expect("second memory should store");
    resume_tx.send(()).expect("retrieval should still be waiting");
    let stale = in_flight
        .await
        .expect("retrieval task should not panic")
        .expect("retrieval should succeed");
    assert!(!stale.used_cache);

    let fresh = retriever
        .retrieve(PRINCIPAL, "window seat", 4, 512)
        .await
        .expect("retrieval should succeed");
    assert!(!fresh.used_cache);
    assert_eq!(fresh.records.len(), 2);
}

#[tokio::test]
async fn memory_writer_writes_are_charged_to_the_write_budget() {
    let limiter = Arc::new(RateLimiter::new(tight_budgets(1)));
    let retriever = retriever_over(Arc::new(InMemoryStore::new())).with_rate_limiter(limiter);
    let writer: &dyn MemoryWriter = &retriever;

    writer
        .remember(PRINCIPAL, "Prefers aisle seats", None)
        .await
        .expect("first write should fit the budget");
    let denied = writer
        .remember(PRINCIPAL, "Prefers morning departures", None)
        .await
        .expect_err("second write should be rate limited");
    assert!(matches!(denied, MemoryError::RateLimited { retry_after_ms } if retry_after_ms > 0));
    assert_eq!(denied.kind(), ErrorKind::RateLimited);

    writer
        .remember("bob", "Prefers window seats", None)
        .await
        .expect("other principals keep their own budget");
}

#[tokio::test]
async fn retrieval_skips_records_that_overflow_the_token_budget() {
    let store = Arc::new(InMemoryStore::new());
    let retriever = retriever_over(store);
    let long = format!("aisle seats {}", "with extra legroom and priority boarding ".repeat(10));
    retriever
        .remember(PRINCIPAL, &long, None)
        .await
        .expect("long memory should store");
    retriever
        .remember(PRINCIPAL, "aisle seats", None)
        .await
        .expect("short memory should store");

    let retrieval = retriever
        .retrieve(PRINCIPAL, "aisle seats", 8, 5)
        .await
        .expect("retrieval should succeed");
    assert_eq!(retrieval.records.len(), 1);
    assert_eq!(retrieval.records[0].record.content, "aisle seats");
}

#[tokio::test]
async fn retrieval_drops_expired_records() {
    let store = Arc::new(InMemoryStore::new());
    let retriever = retriever_over(store);
    retriever
        .insert_memory(types::NewMemory {
            owner_id: PRINCIPAL.to_owned(),
            content: "Hotel booking in Lisbon".to_owned(),
            category: None,
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        })
        .await
        .expect("expired memory should still insert");

    let retrieval = retriever
        .retrieve(PRINCIPAL, "hotel lisbon", 8, 1_024)
        .await
        .expect("retrieval should succeed");
    assert!(retrieval.records.is_empty());
}

#[tokio::test]
async fn blank_memories_are_rejected() {
    let retriever = retriever_over(Arc::new(InMemoryStore::new()));
    let error = retriever
        .remember(PRINCIPAL, "   ", None)
        .await
        .expect_err("blank content should be rejected");
    assert!(matches!(error, types::MemoryError::Query { .. }));
}

// Tool execution engine

#[tokio::test]
async fn invalid_arguments_fail_without_executing() {
    let (tool, calls) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());
    let observer = RecordingObserver::default();

    let record = engine
        .execute(
            pending_record("call-1", "search_flights", json!({ "origin": "SF" })),
            &tool_context(),
            &observer,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ToolCallStatus::Failed);
    assert_eq!(record.attempts, 0);
    let error = record.error.expect("failure should be recorded");
    assert_eq!(error.kind, ErrorKind::Validation);
    assert!(error.message.contains("schema validation failed"));
    assert_eq!(observer.statuses(), vec![ToolCallStatus::Failed]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_tools_fail_validation() {
    let engine = engine_with(ToolRegistry::empty(), RateBudgets::default());
    let record = engine
        .execute(
            pending_record("call-1", "teleport", json!({})),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(record.status, ToolCallStatus::Failed);
    assert_eq!(
        record.error.map(|error| error.kind),
        Some(ErrorKind::Validation)
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = ToolRegistry::builder()
        .register(FlakyLookup {
            failures_left: AtomicU32::new(2),
            calls: calls.clone(),
        })
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());
    let observer = RecordingObserver::default();

    let record = engine
        .execute(
            pending_record("call-1", "flaky_lookup", json!({})),
            &tool_context(),
            &observer,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ToolCallStatus::Succeeded);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.result.as_deref(), Some("looked up"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        observer.statuses(),
        vec![ToolCallStatus::Executing, ToolCallStatus::Succeeded]
    );
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = ToolRegistry::builder()
        .register(FlakyLookup {
            failures_left: AtomicU32::new(10),
            calls: calls.clone(),
        })
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());

    let record = engine
        .execute(
            pending_record("call-1", "flaky_lookup", json!({})),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ToolCallStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(
        record.error.map(|error| error.kind),
        Some(ErrorKind::TransientExternal)
    );
}

#[tokio::test]
async fn rate_limited_tool_calls_fail_with_a_retry_hint() {
    let (tool, calls) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, tight_budgets(1));
    let arguments = json!({ "origin": "SFO", "destination": "JFK" });

    let first = engine
        .execute(
            pending_record("call-1", "search_flights", arguments.clone()),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(first.status, ToolCallStatus::Succeeded);

    let second = engine
        .execute(
            pending_record("call-2", "search_flights", arguments),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(second.status, ToolCallStatus::Failed);
    let error = second.error.expect("rate limit should be recorded");
    assert_eq!(error.kind, ErrorKind::RateLimited);
    assert!(error.message.contains("retry after"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_only_results_are_served_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ToolRegistry::builder()
        .register(AirportLookup {
            calls: calls.clone(),
        })
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());

    let first = engine
        .execute(
            pending_record("call-1", "airport_lookup", json!({ "city": "San Francisco" })),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;
    let second = engine
        .execute(
            pending_record("call-2", "airport_lookup", json!({ "city": " San   Francisco " })),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(first.status, ToolCallStatus::Succeeded);
    assert_eq!(second.status, ToolCallStatus::Succeeded);
    assert_eq!(first.result, second.result);
    assert_eq!(second.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cache().len(), 1);
}

#[tokio::test]
async fn sensitive_tools_wait_for_approval_and_run_once() {
    let tool = booking_tool(None, 1);
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());
    let observer = Arc::new(RecordingObserver::default());

    let task = {
        let engine = engine.clone();
        let observer = observer.clone();
        tokio::spawn(async move {
            engine
                .execute(
                    pending_record("call-9", "book_flight", json!({ "flight": "UA100" })),
                    &tool_context(),
                    observer.as_ref(),
                    &CancellationToken::new(),
                )
                .await
        })
    };

    let pending = wait_for_pending_approval(engine.approvals()).await;
    assert_eq!(pending, "call-9");
    engine
        .approvals()
        .resolve(SESSION, "call-9", ApprovalDecision::Approve)
        .expect("approval should resolve");

    let record = task.await.expect("engine task should not panic");
    assert_eq!(record.status, ToolCallStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(
        observer.statuses(),
        vec![
            ToolCallStatus::AwaitingApproval,
            ToolCallStatus::Executing,
            ToolCallStatus::Failed
        ]
    );
    assert!(engine.approvals().pending_for(SESSION).is_empty());
}

#[tokio::test]
async fn rejected_approvals_never_execute() {
    let registry = ToolRegistry::builder()
        .register(booking_tool(Some("booked"), 0))
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(
                    pending_record("call-9", "book_flight", json!({ "flight": "UA100" })),
                    &tool_context(),
                    &NoopObserver,
                    &CancellationToken::new(),
                )
                .await
        })
    };

    wait_for_pending_approval(engine.approvals()).await;
    let wrong_session = engine
        .approvals()
        .resolve("session-2", "call-9", ApprovalDecision::Approve)
        .expect_err("another session cannot decide");
    assert_eq!(wrong_session.kind(), ErrorKind::Authorization);
    engine
        .approvals()
        .resolve(
            SESSION,
            "call-9",
            ApprovalDecision::Reject {
                reason: Some("too expensive".to_owned()),
            },
        )
        .expect("rejection should resolve");

    let record = task.await.expect("engine task should not panic");
    assert_eq!(record.status, ToolCallStatus::Rejected);
    assert_eq!(record.rejection_reason.as_deref(), Some("too expensive"));
    assert_eq!(record.attempts, 0);

    let stale = engine
        .approvals()
        .resolve(SESSION, "call-9", ApprovalDecision::Approve)
        .expect_err("resolved approvals cannot be decided twice");
    assert_eq!(stale.kind(), ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn unanswered_approvals_time_out_as_rejections() {
    let registry = ToolRegistry::builder()
        .register(booking_tool(Some("booked"), 0))
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());

    let record = engine
        .execute(
            pending_record("call-9", "book_flight", json!({ "flight": "UA100" })),
            &tool_context(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ToolCallStatus::Rejected);
    assert_eq!(record.rejection_reason.as_deref(), Some(APPROVAL_TIMEOUT_REASON));
    assert!(engine.approvals().pending_for(SESSION).is_empty());
}

// Agent graph executor

fn flight_search_script() -> Vec<ProviderStep> {
    vec![
        ProviderStep::Stream(vec![
            tool_call_item(
                0,
                "call_1",
                "search_flights",
                r#"{"origin":"SFO","destination":"JFK"}"#,
            ),
            usage(40, 12),
            StreamItem::FinishReason("tool_calls".to_owned()),
        ]),
        ProviderStep::Stream(vec![
            StreamItem::Text("Found ".to_owned()),
            StreamItem::Text("2 flights: UA100 and DL200.".to_owned()),
            usage(80, 9),
            StreamItem::FinishReason("stop".to_owned()),
        ]),
    ]
}

#[tokio::test]
async fn find_me_a_flight_runs_through_one_tool_call() {
    let provider = Arc::new(ScriptedProvider::new(flight_search_script()));
    let (tool, calls) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let executor = executor_with(
        provider.clone(),
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings::default(),
    );
    let (sender, mut receiver) = mpsc::channel(64);

    let outcome = executor
        .run(
            run_request("find me a flight from SFO to JFK"),
            sender,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome.result.as_ref().expect("run should succeed").as_deref(),
        Some("Found 2 flights: UA100 and DL200.")
    );
    let events = drain(&mut receiver);
    assert_eq!(
        event_types(&events),
        vec![
            "started",
            "tool-call",
            "tool-result",
            "text-delta",
            "text-delta",
            "final"
        ]
    );
    assert!(matches!(
        &events[1],
        StreamPayload::ToolCall { status: ToolCallStatus::Pending, name, .. } if name == "search_flights"
    ));
    assert!(matches!(
        &events[2],
        StreamPayload::ToolResult { status: ToolCallStatus::Succeeded, .. }
    ));
    match events.last() {
        Some(StreamPayload::Final { usage, model, .. }) => {
            assert_eq!(usage.total_tokens, Some(141));
            assert_eq!(model, &ModelId::from(MODEL));
        }
        other => panic!("expected final event, got {other:?}"),
    }

    let path = outcome
        .state_path
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    assert_eq!(
        path,
        vec![
            "deciding",
            "calling_model",
            "deciding",
            "calling_tool(search_flights)",
            "deciding",
            "calling_model",
            "deciding",
            "done"
        ]
    );
    let mut coarse = outcome
        .state_path
        .iter()
        .filter(|state| **state != ExecutorState::CallingModel)
        .map(ExecutorState::as_str)
        .collect::<Vec<_>>();
    coarse.dedup();
    assert_eq!(coarse, vec!["deciding", "calling_tool", "deciding", "done"]);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let sequences = outcome
        .messages
        .iter()
        .map(|message| (message.sequence, message.role))
        .collect::<Vec<_>>();
    assert_eq!(
        sequences,
        vec![
            (2, MessageRole::Assistant),
            (3, MessageRole::Tool),
            (4, MessageRole::Assistant)
        ]
    );
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Succeeded);
    assert_eq!(outcome.tool_calls[0].message_sequence, 2);

    let contexts = provider.contexts();
    assert_eq!(contexts.len(), 2);
    let max_tokens = contexts[0].max_tokens.expect("budget should be applied");
    assert!(max_tokens > 0 && max_tokens < 128_000);
    let tool_reply = contexts[1]
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("second call should see the tool result");
    assert_eq!(tool_reply.tool_call_id.as_deref(), Some("call_1"));
    assert!(
        tool_reply
            .content
            .as_deref()
            .is_some_and(|content| content.contains("UA100"))
    );
}

#[tokio::test]
async fn run_outcome_appends_cleanly_to_the_transcript_store() {
    let provider = Arc::new(ScriptedProvider::new(flight_search_script()));
    let (tool, _) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let executor = executor_with(
        provider,
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings::default(),
    );
    let store = InMemoryStore::new();
    store
        .save_session(&Session::new(SESSION, PRINCIPAL))
        .await
        .expect("session should save");
    let request = run_request("find me a flight");
    store
        .append(SESSION, &request.history, &[])
        .await
        .expect("user message should append");

    let (sender, _receiver) = mpsc::channel(64);
    let outcome = executor
        .run(request, sender, CancellationToken::new())
        .await;
    store
        .append(SESSION, &outcome.messages, &outcome.tool_calls)
        .await
        .expect("run output should continue the transcript without gaps");

    let transcript = store
        .load_transcript(SESSION)
        .await
        .expect("transcript should load");
    let sequences = transcript
        .iter()
        .map(|message| message.sequence)
        .collect::<Vec<_>>();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn cancellation_after_a_tool_call_lets_the_tool_finish() {
    let provider = Arc::new(ScriptedProvider::new(flight_search_script()));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ToolRegistry::builder()
        .register(SearchFlights {
            calls: calls.clone(),
            delay: Duration::from_millis(50),
        })
        .build()
        .expect("registry should build");
    let executor = Arc::new(executor_with(
        provider,
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings::default(),
    ));
    let (sender, mut receiver) = mpsc::channel(64);
    let cancellation = CancellationToken::new();

    let task = {
        let executor = executor.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            executor
                .run(run_request("find me a flight"), sender, cancellation)
                .await
        })
    };

    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        if matches!(event, StreamPayload::ToolCall { .. }) {
            cancellation.cancel();
        }
        events.push(event);
    }
    let outcome = task.await.expect("run task should not panic");

    assert!(matches!(outcome.result, Err(RuntimeError::Cancelled)));
    assert_eq!(outcome.final_state(), Some(&ExecutorState::Failed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert!(outcome.tool_calls[0].status.is_terminal());
    assert_eq!(
        event_types(&events),
        vec!["started", "tool-call", "tool-result", "error"]
    );
    match events.last() {
        Some(StreamPayload::Error { kind, retryable, .. }) => {
            assert_eq!(*kind, ErrorKind::Cancelled);
            assert!(!retryable);
        }
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn queued_tool_calls_do_not_start_after_cancellation() {
    let provider = Arc::new(ScriptedProvider::new(vec![ProviderStep::Stream(vec![
        tool_call_item(0, "call_1", "seat_map", "{}"),
        tool_call_item(1, "call_2", "seat_map", "{}"),
        StreamItem::FinishReason("tool_calls".to_owned()),
    ])]));
    let cancellation = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ToolRegistry::builder()
        .register(CancellingLookup {
            cancellation: cancellation.clone(),
            calls: calls.clone(),
        })
        .build()
        .expect("registry should build");
    let executor = executor_with(
        provider,
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings {
            tool_concurrency: 1,
            ..ExecutorSettings::default()
        },
    );
    let (sender, _receiver) = mpsc::channel(64);

    let outcome = executor
        .run(run_request("show me the seat map twice"), sender, cancellation)
        .await;

    assert!(matches!(outcome.result, Err(RuntimeError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.tool_calls.len(), 2);
    assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Succeeded);
    assert_eq!(outcome.tool_calls[1].status, ToolCallStatus::Failed);
    assert_eq!(outcome.tool_calls[1].attempts, 0);
    assert_eq!(
        outcome.tool_calls[1]
            .error
            .as_ref()
            .expect("skipped call should record why")
            .kind,
        ErrorKind::Cancelled
    );
}

#[tokio::test]
async fn step_budget_ends_the_run_and_answers_unresolved_calls() {
    let provider = Arc::new(ScriptedProvider::new(flight_search_script()));
    let (tool, calls) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let settings = ExecutorSettings {
        max_steps: 1,
        ..ExecutorSettings::default()
    };
    let executor = executor_with(
        provider,
        engine_with(registry, RateBudgets::default()),
        settings,
    );
    let (sender, mut receiver) = mpsc::channel(64);

    let outcome = executor
        .run(run_request("find me a flight"), sender, CancellationToken::new())
        .await;

    assert!(matches!(
        outcome.result,
        Err(RuntimeError::StepBudgetExceeded { max_steps: 1 })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let last = outcome.messages.last().expect("transcript should not be empty");
    assert_eq!(last.role, MessageRole::Tool);
    assert!(matches!(
        last.parts.as_slice(),
        [ContentPart::ToolCallResult { tool_call_id, is_error: true, .. }] if tool_call_id == "call_1"
    ));
    let events = drain(&mut receiver);
    assert_eq!(events.last().map(StreamPayload::event_type), Some("error"));
}

#[tokio::test(start_paused = true)]
async fn silent_model_calls_time_out_after_one_retry() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ProviderStep::Hang,
        ProviderStep::Hang,
    ]));
    let settings = ExecutorSettings {
        model_call_timeout: Duration::from_secs(5),
        ..ExecutorSettings::default()
    };
    let executor = executor_with(
        provider.clone(),
        engine_with(ToolRegistry::empty(), RateBudgets::default()),
        settings,
    );
    let (sender, mut receiver) = mpsc::channel(16);

    let outcome = executor
        .run(run_request("hello"), sender, CancellationToken::new())
        .await;

    assert!(matches!(
        outcome.result,
        Err(RuntimeError::ModelTimeout { timeout_ms: 5_000 })
    ));
    assert_eq!(provider.contexts().len(), 2);
    match drain(&mut receiver).last() {
        Some(StreamPayload::Error { kind, retryable, .. }) => {
            assert_eq!(*kind, ErrorKind::Timeout);
            assert!(retryable);
        }
        other => panic!("expected timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn fatal_provider_errors_fail_the_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![ProviderStep::Fail(
        ProviderError::HttpStatus {
            provider: ProviderId::from("openai"),
            status: 401,
            message: "invalid api key".to_owned(),
        },
    )]));
    let executor = executor_with(
        provider,
        engine_with(ToolRegistry::empty(), RateBudgets::default()),
        ExecutorSettings::default(),
    );
    let (sender, _receiver) = mpsc::channel(16);

    let outcome = executor
        .run(run_request("hello"), sender, CancellationToken::new())
        .await;

    let error = outcome.result.expect_err("run should fail");
    assert_eq!(error.kind(), ErrorKind::FatalExternal);
    assert!(outcome.messages.is_empty());
}

#[tokio::test]
async fn malformed_tool_arguments_are_fed_back_to_the_model() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ProviderStep::Stream(vec![
            tool_call_item(0, "call_1", "search_flights", r#"{"origin":"SFO""#),
            StreamItem::FinishReason("tool_calls".to_owned()),
        ]),
        ProviderStep::Stream(vec![
            StreamItem::Text("Which destination?".to_owned()),
            StreamItem::FinishReason("stop".to_owned()),
        ]),
    ]));
    let (tool, calls) = SearchFlights::new();
    let registry = ToolRegistry::builder()
        .register(tool)
        .build()
        .expect("registry should build");
    let executor = executor_with(
        provider.clone(),
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings::default(),
    );
    let (sender, _receiver) = mpsc::channel(64);

    let outcome = executor
        .run(run_request("find a flight"), sender, CancellationToken::new())
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Failed);
    let feedback = provider.contexts()[1]
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .and_then(|message| message.content.clone())
        .expect("tool feedback should reach the model");
    assert!(feedback.contains("Tool execution failed (validation)"));
}

#[tokio::test]
async fn recalled_memories_become_citations_for_the_caller_only() {
    let store = Arc::new(InMemoryStore::new());
    let retriever = Arc::new(retriever_over(store.clone()));
    let alice = retriever
        .remember(PRINCIPAL, "Alice prefers aisle seats on morning flights", None)
        .await
        .expect("alice memory should store");
    retriever
        .remember("bob", "Bob prefers window seats", None)
        .await
        .expect("bob memory should store");

    let provider = Arc::new(ScriptedProvider::new(vec![
        ProviderStep::Stream(vec![
            tool_call_item(0, "call_m", "recall_memory", r#"{"query":"aisle seats"}"#),
            StreamItem::FinishReason("tool_calls".to_owned()),
        ]),
        ProviderStep::Stream(vec![
            StreamItem::Text("Booking an aisle seat.".to_owned()),
            StreamItem::FinishReason("stop".to_owned()),
        ]),
    ]));
    let executor = executor_with(
        provider.clone(),
        engine_with(ToolRegistry::empty(), RateBudgets::default()),
        ExecutorSettings::default(),
    )
    .with_retriever(retriever);
    let (sender, mut receiver) = mpsc::channel(64);

    let outcome = executor
        .run(run_request("book my usual seat"), sender, CancellationToken::new())
        .await;

    assert!(outcome.result.is_ok());
    assert!(outcome.state_path.contains(&ExecutorState::RetrievingMemory));
    let events = drain(&mut receiver);
    let citations = events
        .iter()
        .filter_map(|event| match event {
            StreamPayload::Citation { record_id, .. } => Some(record_id.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(citations, vec![alice.record_id.clone()]);

    let contexts = provider.contexts();
    assert!(
        contexts[0]
            .tools
            .iter()
            .any(|decl| decl.name == tools::RECALL_MEMORY_TOOL_NAME)
    );
    let memory_reply = contexts[1]
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("memory context should reach the model");
    assert_eq!(memory_reply.tool_call_id.as_deref(), Some("call_m"));
    let memory_text = memory_reply.content.clone().unwrap_or_default();
    assert!(memory_text.starts_with("Relevant memories:"));
    assert!(memory_text.contains(&format!("- [{}]", alice.record_id)));
    assert!(!memory_text.contains("window"));

    let memory_message = outcome
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("memory message should be recorded");
    assert!(matches!(
        memory_message.parts.first(),
        Some(ContentPart::ToolCallResult { tool_call_id, is_error: false, .. }) if tool_call_id == "call_m"
    ));
    assert!(memory_message.parts.iter().any(|part| matches!(
        part,
        ContentPart::MemoryCitation { record_id, .. } if *record_id == alice.record_id
    )));
    assert!(outcome.tool_calls.is_empty());
}

#[tokio::test]
async fn sensitive_calls_pause_the_run_until_approved() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ProviderStep::Stream(vec![
            tool_call_item(0, "call_b", "book_flight", r#"{"flight":"UA100"}"#),
            StreamItem::FinishReason("tool_calls".to_owned()),
        ]),
        ProviderStep::Stream(vec![
            StreamItem::Text("Booked.".to_owned()),
            StreamItem::FinishReason("stop".to_owned()),
        ]),
    ]));
    let registry = ToolRegistry::builder()
        .register(booking_tool(Some("confirmation ABC123"), 1))
        .build()
        .expect("registry should build");
    let engine = engine_with(registry, RateBudgets::default());
    let executor = Arc::new(executor_with(
        provider,
        engine.clone(),
        ExecutorSettings::default(),
    ));
    let (sender, mut receiver) = mpsc::channel(64);

    let task = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .run(run_request("book UA100"), sender, CancellationToken::new())
                .await
        })
    };

    let mut statuses = Vec::new();
    while let Some(event) = receiver.recv().await {
        if let StreamPayload::ToolCall { status, tool_call_id, .. } = &event {
            statuses.push(*status);
            if *status == ToolCallStatus::AwaitingApproval {
                engine
                    .approvals()
                    .resolve(SESSION, tool_call_id, ApprovalDecision::Approve)
                    .expect("approval should resolve");
            }
        }
    }
    let outcome = task.await.expect("run task should not panic");

    assert_eq!(
        statuses,
        vec![ToolCallStatus::Pending, ToolCallStatus::AwaitingApproval]
    );
    assert!(outcome.result.is_ok());
    let booking = ExecutorState::CallingTool {
        tools: vec!["book_flight".to_owned()],
    };
    assert!(outcome.state_path.windows(4).any(|states| states
        == [
            booking.clone(),
            ExecutorState::AwaitingApproval,
            booking.clone(),
            ExecutorState::Deciding,
        ]));
    assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Succeeded);
    assert_eq!(outcome.tool_calls[0].result.as_deref(), Some("confirmation ABC123"));
}

#[tokio::test]
async fn parallel_tool_results_keep_request_order() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ProviderStep::Stream(vec![
            tool_call_item(
                0,
                "call_slow",
                "search_flights",
                r#"{"origin":"SFO","destination":"JFK"}"#,
            ),
            tool_call_item(1, "call_fast", "airport_lookup", r#"{"city":"Tokyo"}"#),
            StreamItem::FinishReason("tool_calls".to_owned()),
        ]),
        ProviderStep::Stream(vec![
            StreamItem::Text("done".to_owned()),
            StreamItem::FinishReason("stop".to_owned()),
        ]),
    ]));
    let registry = ToolRegistry::builder()
        .register(SearchFlights {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::from_millis(30),
        })
        .register(AirportLookup {
            calls: Arc::new(AtomicUsize::new(0)),
        })
        .build()
        .expect("registry should build");
    let executor = executor_with(
        provider,
        engine_with(registry, RateBudgets::default()),
        ExecutorSettings::default(),
    );
    let (sender, mut receiver) = mpsc::channel(64);

    let outcome = executor
        .run(run_request("plan a trip"), sender, CancellationToken::new())
        .await;

    assert!(outcome.result.is_ok());
    let ids = outcome
        .tool_calls
        .iter()
        .map(|record| record.tool_call_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["call_slow", "call_fast"]);
    let completion_order = drain(&mut receiver)
        .into_iter()
        .filter_map(|event| match event {
            StreamPayload::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(completion_order, vec!["call_fast", "call_slow"]);
}
