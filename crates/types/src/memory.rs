use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MemoryError;

/// A persisted fact or preference owned by one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub record_id: String,
    pub owner_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub owner_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A search hit with a backend-specific raw score (higher is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Memory record persistence with principal-scoped search.
///
/// Every read takes the owner id and must never return another owner's
/// records or records expired at `now`.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn insert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError>;

    async fn vector_search(
        &self,
        owner_id: &str,
        embedding: &[f32],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError>;

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError>;
}

pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}
