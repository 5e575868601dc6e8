use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use types::{MemoryError, MemoryRecord, MemoryStore, ScoredMemory};

use crate::LibsqlStore;
use crate::errors::{decode_timestamp, encode_timestamp, query_error};
use crate::scoring::{rank_by_keywords, rank_by_vector};

#[async_trait]
impl MemoryStore for LibsqlStore {
    async fn insert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        let conn = self.connect().await?;
        let embedding_json = serde_json::to_string(&record.embedding)?;
        conn.execute(
            "INSERT INTO memory_records
                 (record_id, owner_id, content, embedding_json, category, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.record_id.as_str(),
                record.owner_id.as_str(),
                record.content.as_str(),
                embedding_json,
                record.category.as_deref(),
                encode_timestamp(record.created_at),
                record.expires_at.map(encode_timestamp),
            ],
        )
        .await
        .map_err(|error| query_error(format!("failed to insert memory record: {error}")))?;
        tracing::debug!(
            record_id = %record.record_id,
            owner_id = %record.owner_id,
            "stored memory record"
        );
        Ok(record)
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        embedding: &[f32],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.live_records(owner_id, now).await?;
        Ok(rank_by_vector(&records, owner_id, embedding, limit, now))
    }

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.live_records(owner_id, now).await?;
        Ok(rank_by_keywords(&records, owner_id, query, limit, now))
    }
}

impl LibsqlStore {
    /// Every unexpired record of one owner, newest first.
    async fn live_records(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT record_id, owner_id, content, embedding_json, category, created_at, expires_at
                 FROM memory_records
                 WHERE owner_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY created_at DESC",
                params![owner_id, encode_timestamp(now)],
            )
            .await
            .map_err(|error| query_error(error.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|error| query_error(error.to_string()))?
        {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }
}

fn record_from_row(row: &Row) -> Result<MemoryRecord, MemoryError> {
    let embedding_json = row
        .get::<String>(3)
        .map_err(|error| query_error(error.to_string()))?;
    let expires_at = row
        .get::<Option<String>>(6)
        .map_err(|error| query_error(error.to_string()))?
        .as_deref()
        .map(decode_timestamp)
        .transpose()?;
    Ok(MemoryRecord {
        record_id: row
            .get::<String>(0)
            .map_err(|error| query_error(error.to_string()))?,
        owner_id: row
            .get::<String>(1)
            .map_err(|error| query_error(error.to_string()))?,
        content: row
            .get::<String>(2)
            .map_err(|error| query_error(error.to_string()))?,
        embedding: serde_json::from_str(&embedding_json)?,
        category: row
            .get::<Option<String>>(4)
            .map_err(|error| query_error(error.to_string()))?,
        created_at: decode_timestamp(
            &row.get::<String>(5)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
        expires_at,
    })
}
