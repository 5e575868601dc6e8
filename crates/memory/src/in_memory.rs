use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use types::{
    MemoryError, MemoryRecord, MemoryStore, RunFailureRecord, ScoredMemory, Session,
    ToolCallRecord, TranscriptMessage, TranscriptStore,
};

use crate::errors::query_error;
use crate::scoring::{rank_by_keywords, rank_by_vector};

#[derive(Default)]
struct SessionEntry {
    session: Option<Session>,
    messages: Vec<TranscriptMessage>,
    tool_calls: Vec<ToolCallRecord>,
    failures: Vec<RunFailureRecord>,
}

/// Process-local store with the same contracts as [`crate::LibsqlStore`].
///
/// Used when durable memory is disabled and throughout the test suites.
/// Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    records: RwLock<Vec<MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_failures(&self, session_id: &str) -> Vec<RunFailureRecord> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.failures.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, MemoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|entry| entry.session.clone()))
    }

    async fn save_session(&self, session: &Session) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session.session_id.clone()).or_default();
        match entry.session.as_mut() {
            Some(existing) => {
                existing.status = session.status;
                existing.last_activity_at = session.last_activity_at;
            }
            None => entry.session = Some(session.clone()),
        }
        Ok(())
    }

    async fn append(
        &self,
        session_id: &str,
        messages: &[TranscriptMessage],
        tool_calls: &[ToolCallRecord],
    ) -> Result<(), MemoryError> {
        if messages.is_empty() && tool_calls.is_empty() {
            return Ok(());
        }
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .filter(|entry| entry.session.is_some())
            .ok_or_else(|| MemoryError::NotFound {
                session_id: session_id.to_owned(),
            })?;

        // Validate the whole batch before touching anything.
        let mut expected = entry.messages.last().map_or(0, |last| last.sequence) + 1;
        for message in messages {
            if message.session_id != session_id || message.sequence != expected {
                return Err(MemoryError::SequenceGap {
                    session_id: session_id.to_owned(),
                    sequence: message.sequence,
                    expected,
                });
            }
            expected += 1;
        }
        let known_sequences = entry
            .messages
            .iter()
            .chain(messages)
            .map(|message| message.sequence)
            .collect::<Vec<_>>();
        for record in tool_calls {
            if record.session_id != session_id {
                return Err(query_error(format!(
                    "tool call `{}` belongs to session `{}`, not `{session_id}`",
                    record.tool_call_id, record.session_id
                )));
            }
            if !known_sequences.contains(&record.message_sequence) {
                return Err(query_error(format!(
                    "tool call `{}` references missing message {}",
                    record.tool_call_id, record.message_sequence
                )));
            }
        }

        entry.messages.extend_from_slice(messages);
        for record in tool_calls {
            match entry
                .tool_calls
                .iter_mut()
                .find(|existing| existing.tool_call_id == record.tool_call_id)
            {
                Some(existing) if existing.status.is_terminal() => {}
                Some(existing) => *existing = record.clone(),
                None => entry.tool_calls.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn load_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>, MemoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default())
    }

    async fn load_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>, MemoryError> {
        let mut records = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.tool_calls.clone())
            .unwrap_or_default();
        records.sort_by(|left, right| {
            left.message_sequence
                .cmp(&right.message_sequence)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.tool_call_id.cmp(&right.tool_call_id))
        });
        Ok(records)
    }

    async fn record_run_failure(&self, failure: &RunFailureRecord) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(&failure.session_id)
            .ok_or_else(|| MemoryError::NotFound {
                session_id: failure.session_id.clone(),
            })?;
        if !entry
            .failures
            .iter()
            .any(|existing| existing.run_id == failure.run_id)
        {
            entry.failures.push(failure.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|existing| existing.record_id == record.record_id)
        {
            return Err(query_error(format!(
                "memory record `{}` already exists",
                record.record_id
            )));
        }
        records.push(record.clone());
        Ok(record)
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        embedding: &[f32],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        let records = self.records.read().await;
        Ok(rank_by_vector(records.iter(), owner_id, embedding, limit, now))
    }

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        let records = self.records.read().await;
        Ok(rank_by_keywords(records.iter(), owner_id, query, limit, now))
    }
}
