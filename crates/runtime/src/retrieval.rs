use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tools::MemoryWriter;
use types::{
    Embedder, MemoryError, MemoryRecord, MemoryStore, ModelId, NewMemory, RerankStrategyKind,
    RetrievalConfig, ScoredMemory,
};

use crate::budget::{HeuristicTokenCounter, TokenCounter};
use crate::cache::{CacheKey, ResultCache, normalize_text};
use crate::rate_limit::{OperationClass, RateLimiter};

pub const DEFAULT_RRF_K: f64 = 60.0;
const MIN_CACHE_TTL: Duration = Duration::from_secs(30);
const MAX_CACHE_TTL: Duration = Duration::from_secs(120);

/// Cache tag covering every retrieval cached for `principal_id`.
pub fn memory_cache_tag(principal_id: &str) -> String {
    format!("memory:{principal_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub records: Vec<ScoredMemory>,
    pub used_cache: bool,
}

/// Combines the vector and keyword candidate lists into one ranking.
///
/// Both inputs arrive with scores already min-max normalised to `[0, 1]`
/// and ordered best first. Implementations only assign fused scores; the
/// retriever sorts and breaks ties.
pub trait RerankStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fuse(&self, vector: &[ScoredMemory], keyword: &[ScoredMemory]) -> Vec<ScoredMemory>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedFusion {
    pub vector_weight: f64,
    pub keyword_weight: f64,
}

impl Default for WeightedFusion {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

impl RerankStrategy for WeightedFusion {
    fn name(&self) -> &'static str {
        "weighted_fusion"
    }

    fn fuse(&self, vector: &[ScoredMemory], keyword: &[ScoredMemory]) -> Vec<ScoredMemory> {
        let mut fused: HashMap<String, ScoredMemory> = HashMap::new();
        for (hits, weight) in [
            (vector, self.vector_weight),
            (keyword, self.keyword_weight),
        ] {
            for hit in hits {
                fused
                    .entry(hit.record.record_id.clone())
                    .or_insert_with(|| ScoredMemory {
                        record: hit.record.clone(),
                        score: 0.0,
                    })
                    .score += weight * hit.score;
            }
        }
        fused.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReciprocalRankFusion {
    pub k: f64,
}

impl Default for ReciprocalRankFusion {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

impl RerankStrategy for ReciprocalRankFusion {
    fn name(&self) -> &'static str {
        "reciprocal_rank_fusion"
    }

    fn fuse(&self, vector: &[ScoredMemory], keyword: &[ScoredMemory]) -> Vec<ScoredMemory> {
        let mut fused: HashMap<String, ScoredMemory> = HashMap::new();
        for hits in [vector, keyword] {
            for (rank, hit) in hits.iter().enumerate() {
                fused
                    .entry(hit.record.record_id.clone())
                    .or_insert_with(|| ScoredMemory {
                        record: hit.record.clone(),
                        score: 0.0,
                    })
                    .score += 1.0 / (self.k + rank as f64 + 1.0);
            }
        }
        fused.into_values().collect()
    }
}

pub fn strategy_from_config(config: &RetrievalConfig) -> Arc<dyn RerankStrategy> {
    match config.strategy {
        RerankStrategyKind::WeightedFusion => Arc::new(WeightedFusion {
            vector_weight: config.vector_weight,
            keyword_weight: config.keyword_weight,
        }),
        RerankStrategyKind::ReciprocalRankFusion => Arc::new(ReciprocalRankFusion::default()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverSettings {
    pub top_k: usize,
    pub candidate_factor: usize,
    pub cache_ttl: Duration,
    pub token_budget: u32,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrieverSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k.max(1),
            candidate_factor: config.candidate_factor.max(1),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs).clamp(MIN_CACHE_TTL, MAX_CACHE_TTL),
            token_budget: config.token_budget,
        }
    }
}

/// Hybrid (vector + keyword) memory search scoped to one principal, with
/// reranking, token-budget truncation and a tagged result cache.
pub struct MemoryRetriever {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    strategy: Arc<dyn RerankStrategy>,
    token_counter: Arc<dyn TokenCounter>,
    counting_model: ModelId,
    cache: ResultCache<Vec<ScoredMemory>>,
    settings: RetrieverSettings,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl MemoryRetriever {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            strategy: Arc::new(WeightedFusion::default()),
            token_counter: Arc::new(HeuristicTokenCounter),
            counting_model: ModelId::from("default"),
            cache: ResultCache::new(),
            settings,
            rate_limiter: None,
        }
    }

    /// Charges writes made through [`MemoryWriter`] against the
    /// principal's `memory_write` budget.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RerankStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_token_counter(
        mut self,
        token_counter: Arc<dyn TokenCounter>,
        model: ModelId,
    ) -> Self {
        self.token_counter = token_counter;
        self.counting_model = model;
        self
    }

    pub fn settings(&self) -> &RetrieverSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ResultCache<Vec<ScoredMemory>> {
        &self.cache
    }

    pub async fn retrieve(
        &self,
        principal_id: &str,
        query_text: &str,
        k: usize,
        token_budget: u32,
    ) -> Result<Retrieval, MemoryError> {
        let k = k.max(1);
        let normalized_query = normalize_text(query_text);
        if normalized_query.is_empty() {
            return Ok(Retrieval {
                records: Vec::new(),
                used_cache: false,
            });
        }

        let key = CacheKey::from_parts(
            &memory_cache_tag(principal_id),
            &json!({
                "query": normalized_query,
                "k": k,
                "budget": token_budget,
            }),
        )?;
        let (records, used_cache) = self
            .cache
            .get_or_compute(
                key,
                self.settings.cache_ttl,
                &[memory_cache_tag(principal_id)],
                || self.search(principal_id, query_text, k, token_budget),
            )
            .await?;

        tracing::debug!(
            principal_id,
            hits = records.len(),
            used_cache,
            strategy = self.strategy.name(),
            "memory retrieval finished"
        );
        Ok(Retrieval {
            // Cached entries are keyed per principal; filter again regardless.
            records: records
                .into_iter()
                .filter(|hit| hit.record.owner_id == principal_id)
                .collect(),
            used_cache,
        })
    }

    async fn search(
        &self,
        principal_id: &str,
        query_text: &str,
        k: usize,
        token_budget: u32,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        let now = Utc::now();
        let candidates = k.saturating_mul(self.settings.candidate_factor);
        let embedding = self.embedder.embed(query_text)?;

        let (vector_hits, keyword_hits) = tokio::join!(
            self.store
                .vector_search(principal_id, &embedding, candidates, now),
            self.store
                .keyword_search(principal_id, query_text, candidates, now),
        );
        let owned = |hits: Vec<ScoredMemory>| {
            hits.into_iter()
                .filter(|hit| hit.record.owner_id == principal_id && hit.record.is_live(now))
                .collect::<Vec<_>>()
        };
        let vector_hits = normalize_scores(owned(vector_hits?));
        let keyword_hits = normalize_scores(owned(keyword_hits?));

        let mut ranked = self.strategy.fuse(&vector_hits, &keyword_hits);
        sort_ranked(&mut ranked);
        Ok(self.fit_budget(ranked, k, token_budget))
    }

    /// Keeps the best-ranked hits whose content fits the remaining budget,
    /// skipping any single hit that would overflow it.
    fn fit_budget(&self, ranked: Vec<ScoredMemory>, k: usize, token_budget: u32) -> Vec<ScoredMemory> {
        let mut remaining = token_budget;
        let mut kept = Vec::with_capacity(k);
        for hit in ranked {
            if kept.len() >= k {
                break;
            }
            let cost = self
                .token_counter
                .count(&self.counting_model, &hit.record.content)
                .tokens;
            if cost <= remaining {
                remaining -= cost;
                kept.push(hit);
            }
        }
        kept
    }

    /// Persists a memory for `principal_id` and drops its cached retrievals.
    pub async fn remember(
        &self,
        principal_id: &str,
        content: &str,
        category: Option<&str>,
    ) -> Result<MemoryRecord, MemoryError> {
        self.insert_memory(NewMemory {
            owner_id: principal_id.to_owned(),
            content: content.to_owned(),
            category: category.map(str::to_owned),
            expires_at: None,
        })
        .await
    }

    pub async fn insert_memory(&self, memory: NewMemory) -> Result<MemoryRecord, MemoryError> {
        let content = memory.content.trim();
        if content.is_empty() {
            return Err(MemoryError::Query {
                message: "memory content must not be empty".to_owned(),
            });
        }
        let record = MemoryRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            owner_id: memory.owner_id,
            content: content.to_owned(),
            embedding: self.embedder.embed(content)?,
            category: memory.category,
            created_at: Utc::now(),
            expires_at: memory.expires_at,
        };
        let stored = self.store.insert(record).await?;
        let invalidated = self
            .cache
            .invalidate_tag(&memory_cache_tag(&stored.owner_id));
        tracing::debug!(
            principal_id = %stored.owner_id,
            record_id = %stored.record_id,
            invalidated,
            "memory stored"
        );
        Ok(stored)
    }
}

#[async_trait]
impl MemoryWriter for MemoryRetriever {
    async fn remember(
        &self,
        principal_id: &str,
        content: &str,
        category: Option<&str>,
    ) -> Result<MemoryRecord, MemoryError> {
        if let Some(rate_limiter) = &self.rate_limiter {
            let decision = rate_limiter
                .check(principal_id, OperationClass::MemoryWrite)
                .await;
            if !decision.allowed {
                tracing::info!(principal_id, retry_after_ms = decision.retry_after_ms, "memory write rate limited");
                return Err(MemoryError::RateLimited {
                    retry_after_ms: decision.retry_after_ms,
                });
            }
        }
        MemoryRetriever::remember(self, principal_id, content, category).await
    }
}

/// Min-max scales scores to `[0, 1]`; a flat list scores 1.0 throughout.
fn normalize_scores(mut hits: Vec<ScoredMemory>) -> Vec<ScoredMemory> {
    let Some(max) = hits.iter().map(|hit| hit.score).reduce(f64::max) else {
        return hits;
    };
    let min = hits
        .iter()
        .map(|hit| hit.score)
        .reduce(f64::min)
        .unwrap_or(max);
    let spread = max - min;
    for hit in &mut hits {
        hit.score = if spread <= f64::EPSILON {
            1.0
        } else {
            (hit.score - min) / spread
        };
    }
    hits.sort_by(|left, right| right.score.total_cmp(&left.score));
    hits
}

/// Score descending, then newer first, then record id.
fn sort_ranked(ranked: &mut [ScoredMemory]) {
    ranked.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| right.record.created_at.cmp(&left.record.created_at))
            .then_with(|| left.record.record_id.cmp(&right.record.record_id))
    });
}

#[cfg(test)]
pub(crate) fn rank_for_test(
    strategy: &dyn RerankStrategy,
    vector: Vec<ScoredMemory>,
    keyword: Vec<ScoredMemory>,
) -> Vec<ScoredMemory> {
    let mut ranked = strategy.fuse(&normalize_scores(vector), &normalize_scores(keyword));
    sort_ranked(&mut ranked);
    ranked
}
