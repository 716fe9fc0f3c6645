//! Relational persistence: jobs, conversations, turns.
//!
//! The job row is the immortal ground truth for observability — one row
//! per `external_event_id`, created on first sight of an event and updated
//! through the lifecycle `pending → downloading → normalizing → embedding →
//! completed | failed`. A job in `completed` short-circuits re-deliveries
//! as `duplicate_event` before any I/O happens.
//!
//! The conversation row, its turn rows, and the job-completion update are
//! committed in one transaction, so a `completed` job always implies a
//! full set of rows and a non-completed job implies none — there is no
//! window in which rows exist without a completed job owning them.
//! Relational failures map to the retryable `persistence_failure`.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::{ErrorCode, StageError, StageResult};
use crate::event::IngestionEvent;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Downloading,
    Normalizing,
    Embedding,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Normalizing => "normalizing",
            JobStatus::Embedding => "embedding",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "downloading" => Some(JobStatus::Downloading),
            "normalizing" => Some(JobStatus::Normalizing),
            "embedding" => Some(JobStatus::Embedding),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Handle to a claimed job row.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    /// Processing attempts observed by this pipeline (not the producer's
    /// delivery counter).
    pub attempt: u32,
}

/// Conversation row to be persisted.
#[derive(Debug)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub external_event_id: String,
    pub trace_id: Uuid,
    pub title: Option<String>,
    pub date: DateTime<Utc>,
    pub duration_sec: Option<i64>,
    pub language: Option<String>,
    pub source_system: String,
    pub participants: serde_json::Value,
    pub topics: serde_json::Value,
    pub aggregates: serde_json::Value,
    pub nlp_source: String,
    pub nlp_partial: bool,
    pub chunk_count: i32,
    pub vector_point_ids: serde_json::Value,
}

/// Turn row to be persisted, one per segment.
#[derive(Debug)]
pub struct TurnRecord {
    pub id: Uuid,
    pub turn_index: i32,
    pub segment_id: String,
    pub speaker_id: String,
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub language: String,
    pub confidence: f64,
    pub sentiment: Option<String>,
    pub sentiment_score: Option<f64>,
    pub sentiment_stars: Option<i32>,
    pub entities: serde_json::Value,
    pub vector_point_id: Option<Uuid>,
}

pub struct Store {
    pool: PgPool,
}

fn db_err(what: &str, err: sqlx::Error) -> StageError {
    StageError::with_source(ErrorCode::PersistenceFailure, what.to_string(), err)
}

impl Store {
    /// Connect with one pooled connection per in-flight worker plus one
    /// for the consumer's own bookkeeping.
    pub async fn connect(database_url: &str, max_parallel_jobs: usize) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_parallel_jobs as u32 + 1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or reclaim the job row for an event.
    ///
    /// Returns `duplicate_event` when the job is already `completed` — the
    /// idempotence short-circuit. A non-terminal or failed-but-retryable
    /// row is reclaimed for another attempt with its counter bumped.
    pub async fn claim_job(&self, event: &IngestionEvent) -> StageResult<JobHandle> {
        let existing: Option<(Uuid, String, i32)> = sqlx::query_as(
            "SELECT id, status, retry_count FROM ingestion_jobs WHERE external_event_id = $1",
        )
        .bind(&event.external_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("job lookup failed", e))?;

        if let Some((id, status, retry_count)) = existing {
            if JobStatus::parse(&status) == Some(JobStatus::Completed) {
                return Err(StageError::new(
                    ErrorCode::DuplicateEvent,
                    format!("event '{}' already completed", event.external_event_id),
                ));
            }

            let attempt = retry_count as u32 + 1;
            sqlx::query(
                "UPDATE ingestion_jobs \
                 SET status = $1, retry_count = $2, started_at = NOW(), \
                     error_code = NULL, error_message = NULL \
                 WHERE id = $3",
            )
            .bind(JobStatus::Downloading.as_str())
            .bind(attempt as i32)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("job reclaim failed", e))?;

            return Ok(JobHandle { id, attempt });
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO ingestion_jobs \
               (id, external_event_id, trace_id, source_bucket, source_key, package_uri, \
                checksum, schema_version, status, retry_count, max_retries, created_at, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, NOW(), NOW()) \
             ON CONFLICT (external_event_id) DO NOTHING",
        )
        .bind(id)
        .bind(&event.external_event_id)
        .bind(event.trace_id)
        .bind(&event.bucket)
        .bind(&event.object_key)
        .bind(&event.package_uri)
        .bind(format!("sha256:{}", event.checksum_hex))
        .bind(event.schema_version.to_string())
        .bind(JobStatus::Downloading.as_str())
        .bind(10i32)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("job insert failed", e))?;

        if inserted.rows_affected() == 0 {
            // Another worker inserted the row between lookup and insert;
            // treat it as a duplicate delivery and let the broker retry.
            return Err(StageError::new(
                ErrorCode::DuplicateEvent,
                format!("event '{}' claimed concurrently", event.external_event_id),
            ));
        }

        Ok(JobHandle { id, attempt: 0 })
    }

    pub async fn set_status(&self, job_id: Uuid, status: JobStatus) -> StageResult<()> {
        sqlx::query("UPDATE ingestion_jobs SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("job status update failed", e))?;
        Ok(())
    }

    pub async fn set_file_size(&self, job_id: Uuid, bytes: i64) -> StageResult<()> {
        sqlx::query("UPDATE ingestion_jobs SET file_size_bytes = $1 WHERE id = $2")
            .bind(bytes)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("job file size update failed", e))?;
        Ok(())
    }

    /// Transactional write of the conversation row, all of its turns, and
    /// the job-completion update.
    ///
    /// Everything commits or nothing does: a failure here leaves the job
    /// row non-terminal with no conversation or turn rows behind, so a
    /// re-delivery can rerun the whole write sequence without
    /// accumulating orphans.
    pub async fn persist_and_complete(
        &self,
        job_id: Uuid,
        conversation: &ConversationRecord,
        turns: &[TurnRecord],
        processing_metadata: serde_json::Value,
        duration_ms: i64,
    ) -> StageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("transaction begin failed", e))?;

        sqlx::query(
            "INSERT INTO conversations \
               (id, external_event_id, trace_id, title, date, duration_sec, language, \
                source_system, participants, topics, aggregates, nlp_source, nlp_partial, \
                chunk_count, vector_point_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())",
        )
        .bind(conversation.id)
        .bind(&conversation.external_event_id)
        .bind(conversation.trace_id)
        .bind(&conversation.title)
        .bind(conversation.date)
        .bind(conversation.duration_sec)
        .bind(&conversation.language)
        .bind(&conversation.source_system)
        .bind(&conversation.participants)
        .bind(&conversation.topics)
        .bind(&conversation.aggregates)
        .bind(&conversation.nlp_source)
        .bind(conversation.nlp_partial)
        .bind(conversation.chunk_count)
        .bind(&conversation.vector_point_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("conversation insert failed", e))?;

        for turn in turns {
            sqlx::query(
                "INSERT INTO conversation_turns \
                   (id, conversation_id, turn_index, segment_id, speaker_id, text, start_ms, \
                    end_ms, language, confidence, sentiment, sentiment_score, sentiment_stars, \
                    entities, vector_point_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())",
            )
            .bind(turn.id)
            .bind(conversation.id)
            .bind(turn.turn_index)
            .bind(&turn.segment_id)
            .bind(&turn.speaker_id)
            .bind(&turn.text)
            .bind(turn.start_ms)
            .bind(turn.end_ms)
            .bind(&turn.language)
            .bind(turn.confidence)
            .bind(&turn.sentiment)
            .bind(turn.sentiment_score)
            .bind(turn.sentiment_stars)
            .bind(&turn.entities)
            .bind(turn.vector_point_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("turn insert failed", e))?;
        }

        sqlx::query(
            "UPDATE ingestion_jobs \
             SET status = $1, conversation_id = $2, processing_metadata = $3, \
                 processing_duration_ms = $4, completed_at = NOW() \
             WHERE id = $5",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(conversation.id)
        .bind(&processing_metadata)
        .bind(duration_ms)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("job completion failed", e))?;

        tx.commit()
            .await
            .map_err(|e| db_err("transaction commit failed", e))?;
        Ok(())
    }

    /// Record a failure on the job row. Terminal when `terminal` is set;
    /// otherwise the row stays in its non-terminal state for re-delivery.
    pub async fn record_failure(
        &self,
        job_id: Uuid,
        error_code: &str,
        error_message: &str,
        terminal: bool,
    ) -> StageResult<()> {
        let query = if terminal {
            "UPDATE ingestion_jobs \
             SET status = 'failed', error_code = $1, error_message = $2, last_error_at = NOW() \
             WHERE id = $3"
        } else {
            "UPDATE ingestion_jobs \
             SET error_code = $1, error_message = $2, last_error_at = NOW() \
             WHERE id = $3"
        };
        sqlx::query(query)
            .bind(error_code)
            .bind(error_message)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("job failure update failed", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Downloading,
            JobStatus::Normalizing,
            JobStatus::Embedding,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("retrying"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Embedding.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
