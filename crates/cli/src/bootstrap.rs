use std::{sync::Arc, time::Duration};

use gateway::{BroadcastSettings, CoordinatorSettings, SessionCoordinator, StreamBroadcaster};
use memory::{HashingEmbedder, InMemoryStore, LibsqlStore};
use provider::RetryPolicy;
use runtime::{
    AgentGraphExecutor, ApprovalRegistry, ExecutorSettings, HeuristicTokenCounter,
    MemoryRetriever, ModelLimits, RateLimiter, RetrieverSettings, ToolExecutionEngine,
    strategy_from_config,
};
use tokio_util::sync::CancellationToken;
use tools::{MemoryWriter, build_registry};
use types::{AgentConfig, MemoryStore, Provider, TranscriptStore};

use crate::CliError;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a running gateway needs, wired from one validated config.
pub struct GatewayApp {
    pub config: AgentConfig,
    pub coordinator: Arc<SessionCoordinator>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl GatewayApp {
    /// Periodically drops idle rate-limit buckets, expired cache entries and
    /// finished event logs until `shutdown` fires.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let buckets = rate_limiter.purge_idle();
                        let purged = coordinator.purge_expired();
                        if buckets > 0 || purged.total() > 0 {
                            tracing::debug!(
                                buckets,
                                event_logs = purged.event_logs,
                                tool_results = purged.tool_results,
                                retrievals = purged.retrievals,
                                "maintenance pass purged idle state"
                            );
                        }
                    }
                }
            }
        })
    }
}

pub async fn bootstrap_gateway(config: AgentConfig) -> Result<GatewayApp, CliError> {
    config.validate()?;
    let provider = provider::build_provider(&config)?;
    bootstrap_gateway_with_provider(config, provider).await
}

/// Wires stores, tools, executor and coordinator around `provider`.
///
/// Without durable memory, transcripts live in process memory and the
/// memory endpoints report memory as disabled.
pub async fn bootstrap_gateway_with_provider(
    config: AgentConfig,
    provider: Arc<dyn Provider>,
) -> Result<GatewayApp, CliError> {
    config.validate()?;

    let (transcripts, memories): (Arc<dyn TranscriptStore>, Option<Arc<dyn MemoryStore>>) =
        match LibsqlStore::from_config(&config.memory).await? {
            Some(store) => {
                let store = Arc::new(store);
                let memories: Arc<dyn MemoryStore> = store.clone();
                (store as Arc<dyn TranscriptStore>, Some(memories))
            }
            None => {
                tracing::warn!("durable memory disabled; transcripts are kept in process memory");
                (Arc::new(InMemoryStore::new()) as Arc<dyn TranscriptStore>, None)
            }
        };

    let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limits));
    let retriever = memories.map(|store| {
        let retrieval = &config.memory.retrieval;
        Arc::new(
            MemoryRetriever::new(
                store,
                Arc::new(HashingEmbedder::default()),
                RetrieverSettings::from(retrieval),
            )
            .with_strategy(strategy_from_config(retrieval))
            .with_token_counter(Arc::new(HeuristicTokenCounter), config.selection.model.clone())
            .with_rate_limiter(rate_limiter.clone()),
        )
    });

    let registry = build_registry(
        &config.tools,
        retriever
            .clone()
            .map(|retriever| retriever as Arc<dyn MemoryWriter>),
    )?;
    let engine = ToolExecutionEngine::new(
        Arc::new(registry),
        rate_limiter.clone(),
        Arc::new(ApprovalRegistry::new()),
    )
    .with_retry_policy(RetryPolicy::from(&config.reliability))
    .with_approval_timeout(Duration::from_secs(config.runtime.approval_timeout_secs));

    let limits = ModelLimits::from_catalog(provider.model_catalog(), &config.budget);
    let mut executor = AgentGraphExecutor::new(
        provider,
        Arc::new(engine),
        rate_limiter.clone(),
        limits,
        ExecutorSettings::from_config(&config),
    );
    if let Some(retriever) = retriever {
        executor = executor.with_retriever(retriever);
    }

    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::new(executor),
        transcripts,
        rate_limiter.clone(),
        Arc::new(StreamBroadcaster::new(BroadcastSettings::from(&config.gateway))),
        CoordinatorSettings::from_config(&config),
    ));
    tracing::info!(
        provider = %config.selection.provider,
        model = %config.selection.model,
        memory = config.memory.enabled,
        "gateway wired"
    );

    Ok(GatewayApp {
        config,
        coordinator,
        rate_limiter,
    })
}
