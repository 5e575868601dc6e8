use async_trait::async_trait;
use libsql::{Connection, Row, params};
use types::{
    MemoryError, MessageRole, RunFailureRecord, Session, SessionStatus, ToolCallRecord,
    ToolCallStatus, ToolFailure, TranscriptMessage, TranscriptStore,
};

use crate::LibsqlStore;
use crate::errors::{
    decode_timestamp, encode_timestamp, from_sql_integer, query_error, to_sql_integer,
};
use crate::schema::rollback_quietly;

#[async_trait]
impl TranscriptStore for LibsqlStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, MemoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT session_id, principal_id, status, created_at, last_activity_at
                 FROM sessions
                 WHERE session_id = ?1
                 LIMIT 1",
                params![session_id],
            )
            .await
            .map_err(|error| query_error(error.to_string()))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|error| query_error(error.to_string()))?
        else {
            return Ok(None);
        };
        session_from_row(&row).map(Some)
    }

    async fn save_session(&self, session: &Session) -> Result<(), MemoryError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO sessions (session_id, principal_id, status, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 status = excluded.status,
                 last_activity_at = excluded.last_activity_at",
            params![
                session.session_id.as_str(),
                session.principal_id.as_str(),
                session.status.as_str(),
                encode_timestamp(session.created_at),
                encode_timestamp(session.last_activity_at),
            ],
        )
        .await
        .map_err(|error| query_error(format!("failed to save session: {error}")))?;
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
        let conn = self.connect().await?;

        conn.execute("BEGIN IMMEDIATE TRANSACTION", params![])
            .await
            .map_err(|error| query_error(error.to_string()))?;
        let transaction_result = async {
            ensure_session_exists(&conn, session_id).await?;
            ensure_next_sequence(&conn, session_id, messages).await?;
            for message in messages {
                insert_message(&conn, message).await?;
            }
            for record in tool_calls {
                upsert_tool_call(&conn, session_id, record).await?;
            }
            Ok::<(), MemoryError>(())
        }
        .await;
        if let Err(error) = transaction_result {
            rollback_quietly(&conn).await;
            return Err(error);
        }
        conn.execute("COMMIT TRANSACTION", params![])
            .await
            .map_err(|error| query_error(error.to_string()))?;

        tracing::debug!(
            session_id,
            messages = messages.len(),
            tool_calls = tool_calls.len(),
            "appended transcript entries"
        );
        Ok(())
    }

    async fn load_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>, MemoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT message_id, session_id, sequence, role, parts_json, created_at, token_count
                 FROM transcript_messages
                 WHERE session_id = ?1
                 ORDER BY sequence ASC",
                params![session_id],
            )
            .await
            .map_err(|error| query_error(error.to_string()))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|error| query_error(error.to_string()))?
        {
            messages.push(message_from_row(&row)?);
        }
        Ok(messages)
    }

    async fn load_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>, MemoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT tool_call_id, session_id, message_sequence, tool_name, input_json, status,
                        result, error_json, rejection_reason, attempts, created_at, updated_at
                 FROM transcript_tool_calls
                 WHERE session_id = ?1
                 ORDER BY message_sequence ASC, created_at ASC, tool_call_id ASC",
                params![session_id],
            )
            .await
            .map_err(|error| query_error(error.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|error| query_error(error.to_string()))?
        {
            records.push(tool_call_from_row(&row)?);
        }
        Ok(records)
    }

    async fn record_run_failure(&self, failure: &RunFailureRecord) -> Result<(), MemoryError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO run_failures (run_id, session_id, kind, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id) DO NOTHING",
            params![
                failure.run_id.as_str(),
                failure.session_id.as_str(),
                failure.kind.as_str(),
                failure.message.as_str(),
                encode_timestamp(failure.created_at),
            ],
        )
        .await
        .map_err(|error| query_error(format!("failed to record run failure: {error}")))?;
        Ok(())
    }
}

async fn ensure_session_exists(conn: &Connection, session_id: &str) -> Result<(), MemoryError> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM sessions WHERE session_id = ?1 LIMIT 1",
            params![session_id],
        )
        .await
        .map_err(|error| query_error(error.to_string()))?;
    let found = rows
        .next()
        .await
        .map_err(|error| query_error(error.to_string()))?
        .is_some();
    if !found {
        return Err(MemoryError::NotFound {
            session_id: session_id.to_owned(),
        });
    }
    Ok(())
}

/// Rejects a batch unless it continues the stored transcript one by one.
async fn ensure_next_sequence(
    conn: &Connection,
    session_id: &str,
    messages: &[TranscriptMessage],
) -> Result<(), MemoryError> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(sequence), 0) FROM transcript_messages WHERE session_id = ?1",
            params![session_id],
        )
        .await
        .map_err(|error| query_error(error.to_string()))?;
    let row = rows
        .next()
        .await
        .map_err(|error| query_error(error.to_string()))?
        .ok_or_else(|| query_error("failed to inspect existing sequence state".to_owned()))?;
    let max_sequence = from_sql_integer(
        row.get::<i64>(0)
            .map_err(|error| query_error(error.to_string()))?,
        "sequence",
    )?;

    let mut expected = max_sequence + 1;
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
    Ok(())
}

async fn insert_message(conn: &Connection, message: &TranscriptMessage) -> Result<(), MemoryError> {
    let parts_json = serde_json::to_string(&message.parts)?;
    conn.execute(
        "INSERT INTO transcript_messages
             (session_id, sequence, message_id, role, parts_json, token_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.session_id.as_str(),
            to_sql_integer(message.sequence, "transcript sequence")?,
            message.message_id.as_str(),
            message.role.as_str(),
            parts_json,
            i64::from(message.token_count),
            encode_timestamp(message.created_at),
        ],
    )
    .await
    .map_err(|error| query_error(format!("failed to append transcript message: {error}")))?;
    Ok(())
}

/// Inserts a tool-call row or advances it; rows already in a terminal state
/// are left untouched.
async fn upsert_tool_call(
    conn: &Connection,
    session_id: &str,
    record: &ToolCallRecord,
) -> Result<(), MemoryError> {
    if record.session_id != session_id {
        return Err(query_error(format!(
            "tool call `{}` belongs to session `{}`, not `{session_id}`",
            record.tool_call_id, record.session_id
        )));
    }
    let input_json = serde_json::to_string(&record.input)?;
    let error_json = record
        .error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO transcript_tool_calls (
             tool_call_id, session_id, message_sequence, tool_name, input_json, status,
             result, error_json, rejection_reason, attempts, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(tool_call_id) DO UPDATE SET
             status = excluded.status,
             result = excluded.result,
             error_json = excluded.error_json,
             rejection_reason = excluded.rejection_reason,
             attempts = excluded.attempts,
             updated_at = excluded.updated_at
         WHERE transcript_tool_calls.status NOT IN ('succeeded', 'failed', 'rejected')",
        params![
            record.tool_call_id.as_str(),
            record.session_id.as_str(),
            to_sql_integer(record.message_sequence, "message sequence")?,
            record.tool_name.as_str(),
            input_json,
            record.status.as_str(),
            record.result.as_deref(),
            error_json,
            record.rejection_reason.as_deref(),
            i64::from(record.attempts),
            encode_timestamp(record.created_at),
            encode_timestamp(record.updated_at),
        ],
    )
    .await
    .map_err(|error| query_error(format!("failed to store tool call: {error}")))?;
    Ok(())
}

fn session_from_row(row: &Row) -> Result<Session, MemoryError> {
    let status = row
        .get::<String>(2)
        .map_err(|error| query_error(error.to_string()))?;
    Ok(Session {
        session_id: row
            .get::<String>(0)
            .map_err(|error| query_error(error.to_string()))?,
        principal_id: row
            .get::<String>(1)
            .map_err(|error| query_error(error.to_string()))?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| query_error(format!("unknown stored session status `{status}`")))?,
        created_at: decode_timestamp(
            &row.get::<String>(3)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
        last_activity_at: decode_timestamp(
            &row.get::<String>(4)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
    })
}

fn message_from_row(row: &Row) -> Result<TranscriptMessage, MemoryError> {
    let role = row
        .get::<String>(3)
        .map_err(|error| query_error(error.to_string()))?;
    let parts_json = row
        .get::<String>(4)
        .map_err(|error| query_error(error.to_string()))?;
    let token_count = row
        .get::<i64>(6)
        .map_err(|error| query_error(error.to_string()))?;
    Ok(TranscriptMessage {
        message_id: row
            .get::<String>(0)
            .map_err(|error| query_error(error.to_string()))?,
        session_id: row
            .get::<String>(1)
            .map_err(|error| query_error(error.to_string()))?,
        sequence: from_sql_integer(
            row.get::<i64>(2)
                .map_err(|error| query_error(error.to_string()))?,
            "sequence",
        )?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| query_error(format!("unknown stored message role `{role}`")))?,
        parts: serde_json::from_str(&parts_json)?,
        created_at: decode_timestamp(
            &row.get::<String>(5)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
        token_count: u32::try_from(token_count)
            .map_err(|_| query_error("stored token count out of range".to_owned()))?,
    })
}

fn tool_call_from_row(row: &Row) -> Result<ToolCallRecord, MemoryError> {
    let input_json = row
        .get::<String>(4)
        .map_err(|error| query_error(error.to_string()))?;
    let status = row
        .get::<String>(5)
        .map_err(|error| query_error(error.to_string()))?;
    let error = row
        .get::<Option<String>>(7)
        .map_err(|error| query_error(error.to_string()))?
        .map(|json| serde_json::from_str::<ToolFailure>(&json))
        .transpose()?;
    let attempts = row
        .get::<i64>(9)
        .map_err(|error| query_error(error.to_string()))?;
    Ok(ToolCallRecord {
        tool_call_id: row
            .get::<String>(0)
            .map_err(|error| query_error(error.to_string()))?,
        session_id: row
            .get::<String>(1)
            .map_err(|error| query_error(error.to_string()))?,
        message_sequence: from_sql_integer(
            row.get::<i64>(2)
                .map_err(|error| query_error(error.to_string()))?,
            "message sequence",
        )?,
        tool_name: row
            .get::<String>(3)
            .map_err(|error| query_error(error.to_string()))?,
        input: serde_json::from_str(&input_json)?,
        status: ToolCallStatus::parse(&status)
            .ok_or_else(|| query_error(format!("unknown stored tool call status `{status}`")))?,
        result: row
            .get::<Option<String>>(6)
            .map_err(|error| query_error(error.to_string()))?,
        error,
        rejection_reason: row
            .get::<Option<String>>(8)
            .map_err(|error| query_error(error.to_string()))?,
        attempts: u32::try_from(attempts)
            .map_err(|_| query_error("stored attempt count out of range".to_owned()))?,
        created_at: decode_timestamp(
            &row.get::<String>(10)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
        updated_at: decode_timestamp(
            &row.get::<String>(11)
                .map_err(|error| query_error(error.to_string()))?,
        )?,
    })
}
