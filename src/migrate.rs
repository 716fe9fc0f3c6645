//! Database schema migrations.
//!
//! Creates the three persistence tables and their indexes. All statements
//! are `IF NOT EXISTS`, so `ingestd init` is idempotent and safe to run on
//! every deploy.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `conversations` | Validated conversation metadata, aggregates, vector point references |
//! | `ingestion_jobs` | One row per event; lifecycle, retries, error codes, timings |
//! | `conversation_turns` | One row per segment with sentiment and entities |
//!
//! # Indexes
//!
//! - `ingestion_jobs(external_event_id)` — unique, the dedup key
//! - `conversations(external_event_id)` — unique; one conversation per event
//! - `ingestion_jobs(trace_id)`, `(status)`, `(error_code)` — operator triage
//! - `conversations(date)` — date-range queries from the API layer
//! - `conversation_turns(conversation_id)` — turn lookups

use anyhow::Result;
use sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id UUID PRIMARY KEY,
            external_event_id TEXT NOT NULL UNIQUE,
            trace_id UUID NOT NULL,
            title TEXT,
            date TIMESTAMPTZ NOT NULL,
            duration_sec BIGINT,
            language TEXT,
            source_system TEXT NOT NULL,
            participants JSONB NOT NULL DEFAULT '[]',
            topics JSONB NOT NULL DEFAULT '[]',
            aggregates JSONB NOT NULL DEFAULT '{}',
            nlp_source TEXT NOT NULL,
            nlp_partial BOOLEAN NOT NULL DEFAULT FALSE,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            vector_point_ids JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_jobs (
            id UUID PRIMARY KEY,
            external_event_id TEXT NOT NULL UNIQUE,
            trace_id UUID NOT NULL,
            source_bucket TEXT NOT NULL,
            source_key TEXT NOT NULL,
            package_uri TEXT NOT NULL,
            checksum TEXT NOT NULL,
            schema_version TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            last_error_at TIMESTAMPTZ,
            error_code TEXT,
            error_message TEXT,
            processing_metadata JSONB NOT NULL DEFAULT '{}',
            conversation_id UUID REFERENCES conversations(id),
            file_size_bytes BIGINT,
            processing_duration_ms BIGINT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            id UUID PRIMARY KEY,
            conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            turn_index INTEGER NOT NULL,
            segment_id TEXT NOT NULL,
            speaker_id TEXT NOT NULL,
            text TEXT NOT NULL,
            start_ms BIGINT NOT NULL,
            end_ms BIGINT NOT NULL,
            language TEXT NOT NULL,
            confidence DOUBLE PRECISION NOT NULL,
            sentiment TEXT,
            sentiment_score DOUBLE PRECISION,
            sentiment_stars INTEGER,
            entities JSONB NOT NULL DEFAULT '[]',
            vector_point_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (conversation_id, turn_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_trace_id ON ingestion_jobs(trace_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON ingestion_jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_error_code ON ingestion_jobs(error_code)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_date ON conversations(date)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_turns_conversation_id \
         ON conversation_turns(conversation_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
