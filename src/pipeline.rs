//! Per-event pipeline orchestration.
//!
//! [`process_event`] drives one stream entry through the full stage
//! sequence: parse → claim job → download → verify checksums → extract →
//! validate → enrich → index vectors → persist → complete. Stages are
//! strictly ordered; each runs under its configured deadline and returns a
//! typed [`StageError`] on failure. The caller (the consumer) hands
//! failures to the error router — nothing here decides retry vs. DLQ.
//!
//! Temporary state lives in a per-job [`TempDir`] owned by this function's
//! future, so files are removed on success, failure, and cancellation
//! alike (dropping the future drops the directory).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::checksum;
use crate::context::AppContext;
use crate::document::ConversationDocument;
use crate::enrich::{self, Enrichment};
use crate::error::{ErrorCode, StageError, StageResult};
use crate::event::{parse_event, IngestionEvent};
use crate::metrics;
use crate::package::{self, ExtractedPackage};
use crate::store::{ConversationRecord, JobHandle, JobStatus, TurnRecord};
use crate::validate;
use crate::vector_index::{VectorPayload, VectorPoint};

/// Everything the error router needs when an attempt fails.
pub struct ProcessResult {
    pub outcome: StageResult<()>,
    pub event: Option<IngestionEvent>,
    pub job_id: Option<Uuid>,
    /// Effective attempt count: the larger of the producer's delivery
    /// counter and our own processing counter.
    pub attempt: u32,
}

async fn with_deadline<T>(
    deadline: Duration,
    stage: &str,
    fut: impl Future<Output = StageResult<T>>,
) -> StageResult<T> {
    timeout(deadline, fut)
        .await
        .map_err(|_| StageError::timeout(stage, deadline.as_secs_f64()))?
}

/// Run a CPU/disk-bound closure off the async runtime.
async fn blocking<T: Send + 'static>(
    stage: &'static str,
    f: impl FnOnce() -> StageResult<T> + Send + 'static,
) -> StageResult<T> {
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StageError::with_source(
            ErrorCode::ProcessingFailure,
            format!("{stage} task panicked or was aborted"),
            e,
        )
    })?
}

/// Process one stream entry end to end.
pub async fn process_event(
    ctx: &AppContext,
    raw_fields: &HashMap<String, String>,
    received_at: Instant,
) -> ProcessResult {
    let deadlines = &ctx.config.processing.deadlines;

    // ── C2: parse the envelope (pure, no I/O) ──────────────────────────
    let parse_started = Instant::now();
    let event = match parse_event(raw_fields, &ctx.config.known_schema_majors) {
        Ok(event) => event,
        Err(err) => {
            return ProcessResult {
                outcome: Err(err),
                event: None,
                job_id: None,
                attempt: raw_fields
                    .get("retry_count")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            }
        }
    };
    if parse_started.elapsed() > deadlines.parse {
        tracing::warn!(
            external_event_id = %event.external_event_id,
            "envelope parse exceeded its deadline"
        );
    }
    metrics::record_trace_id_present();

    let span = info_span!(
        "ingest",
        trace_id = %event.trace_id,
        external_event_id = %event.external_event_id,
    );

    let (outcome, job_id, attempt) = run_stages(ctx, &event, received_at)
        .instrument(span)
        .await;

    ProcessResult {
        attempt: attempt.max(event.retry_count),
        outcome,
        event: Some(event),
        job_id,
    }
}

/// The stage sequence after a valid envelope. Returns the outcome plus the
/// job id and attempt counter for routing.
async fn run_stages(
    ctx: &AppContext,
    event: &IngestionEvent,
    received_at: Instant,
) -> (StageResult<()>, Option<Uuid>, u32) {
    // ── C7 precondition: claim the job row, duplicate short-circuit ────
    let job = match ctx.store.claim_job(event).await {
        Ok(job) => job,
        Err(err) => return (Err(err), None, 0),
    };
    let attempt = job.attempt;

    let outcome = run_claimed(ctx, event, &job, received_at).await;
    (outcome, Some(job.id), attempt)
}

async fn run_claimed(
    ctx: &AppContext,
    event: &IngestionEvent,
    job: &JobHandle,
    received_at: Instant,
) -> StageResult<()> {
    let deadlines = ctx.config.processing.deadlines.clone();

    // Scoped workspace for this job; removed on every exit path.
    let workdir = TempDir::new().map_err(|e| {
        StageError::with_source(
            ErrorCode::ProcessingFailure,
            "cannot create job temp directory",
            e,
        )
    })?;
    let archive_path = workdir.path().join("package.tar.gz");

    // ── C3: download ───────────────────────────────────────────────────
    if event.bucket != ctx.config.object_store.ingestion_bucket {
        tracing::warn!(
            bucket = %event.bucket,
            expected = %ctx.config.object_store.ingestion_bucket,
            "event addresses a bucket outside the producer contract"
        );
    }
    info!(bucket = %event.bucket, key = %event.object_key, "downloading package");
    let archive_bytes = with_deadline(
        deadlines.download,
        "download",
        ctx.object_store
            .download(&event.bucket, &event.object_key, &archive_path),
    )
    .await?;
    metrics::record_download_size(archive_bytes);
    ctx.store.set_file_size(job.id, archive_bytes as i64).await?;

    // ── C4 + C3: verify archive digest, extract, verify manifest ──────
    ctx.store.set_status(job.id, JobStatus::Normalizing).await?;
    let checksum_started = Instant::now();
    let extracted = with_deadline(
        deadlines.checksum,
        "checksum",
        verify_and_extract(ctx, event, archive_path.clone(), workdir.path().to_path_buf()),
    )
    .await?;
    metrics::record_checksum_duration(checksum_started.elapsed().as_secs_f64());

    // ── C5: validate the conversation document ─────────────────────────
    let validation_started = Instant::now();
    let doc = with_deadline(deadlines.validate, "validate", async {
        let expected = event.external_event_id.clone();
        let majors = ctx.config.known_schema_majors.clone();
        let path = extracted.conversation_json();
        blocking("validate", move || {
            let bytes = std::fs::read(&path).map_err(|e| {
                StageError::with_source(
                    ErrorCode::ProcessingFailure,
                    "cannot read conversation.json",
                    e,
                )
            })?;
            let doc = validate::parse_document(&bytes)?;
            validate::validate_document(&doc, &expected, &majors)?;
            Ok(doc)
        })
        .await
    })
    .await?;
    metrics::record_validation_duration(validation_started.elapsed().as_secs_f64());
    metrics::record_conversation_shape(doc.segments.len(), doc.participants.len());
    info!(
        segments = doc.segments.len(),
        participants = doc.participants.len(),
        "validation passed"
    );

    // ── C6: enrichment (chunk, embed, annotate) ────────────────────────
    ctx.store.set_status(job.id, JobStatus::Embedding).await?;
    let enrichment = enrich::run_enrichment(
        &doc,
        &ctx.embedder,
        ctx.config.nlp_enable_local,
        &deadlines,
    )
    .await?;
    metrics::record_nlp_source(enrichment.nlp_source);
    metrics::record_nlp_duration(
        enrichment.nlp_source,
        enrichment.nlp_duration_ms as f64 / 1000.0,
    );
    info!(
        strategy = enrichment.strategy.as_str(),
        chunks = enrichment.chunks.len(),
        nlp_source = enrichment.nlp_source.as_str(),
        nlp_partial = enrichment.nlp_partial,
        "enrichment complete"
    );

    // ── C6.4: vector indexing, ordered by chunk_index ──────────────────
    let conversation_id = Uuid::new_v4();
    let points = build_points(&enrichment, conversation_id, event.trace_id);
    let indexed = with_deadline(deadlines.vector_write, "vector_write", async {
        ctx.vector_index
            .ensure_collection(ctx.embedder.dims())
            .await?;
        ctx.vector_index.upsert_points(&points).await
    })
    .await;

    if let Err(err) = indexed {
        // Upserts are batched; earlier batches may already be durable.
        // Sweep them out so a failed job leaves no orphan points.
        compensate_vectors(ctx, conversation_id).await;
        return Err(err);
    }

    // ── C7: transactional relational write + job completion ────────────
    let (conversation, turns) = build_records(&doc, &enrichment, &points, conversation_id, event);
    let processing_metadata = serde_json::json!({
        "segment_count": doc.segments.len(),
        "participant_count": doc.participants.len(),
        "chunk_count": enrichment.chunks.len(),
        "chunk_strategy": enrichment.strategy.as_str(),
        "nlp_source": enrichment.nlp_source.as_str(),
        "nlp_partial": enrichment.nlp_partial,
        "nlp_error": enrichment.nlp_error,
        "nlp_duration_ms": enrichment.nlp_duration_ms,
        "persons": enrichment.aggregates.top_persons,
        "avg_stars": enrichment.aggregates.avg_stars,
    });
    let duration = received_at.elapsed();
    let persisted = with_deadline(
        deadlines.persist,
        "persist",
        ctx.store.persist_and_complete(
            job.id,
            &conversation,
            &turns,
            processing_metadata,
            duration.as_millis() as i64,
        ),
    )
    .await;

    if let Err(err) = persisted {
        // The rows and the completion update rolled back together; the
        // vectors are already durable and must go too.
        compensate_vectors(ctx, conversation_id).await;
        return Err(err);
    }
    metrics::record_processing_duration(duration.as_secs_f64());

    info!(
        conversation_id = %conversation_id,
        duration_ms = duration.as_millis() as u64,
        "ingestion completed"
    );
    Ok(())
}

/// Compensating delete: remove every point written for a conversation
/// whose job is failing. Best-effort — the stage error it accompanies is
/// returned either way, and a miss is logged for operator cleanup.
async fn compensate_vectors(ctx: &AppContext, conversation_id: Uuid) {
    if let Err(delete_err) = ctx.vector_index.delete_by_conversation(conversation_id).await {
        tracing::error!(
            conversation_id = %conversation_id,
            "compensating vector delete failed: {delete_err}"
        );
    }
}

/// Blocking half of C3/C4: digest the archive, unpack it, verify the
/// manifest.
async fn verify_and_extract(
    ctx: &AppContext,
    event: &IngestionEvent,
    archive_path: PathBuf,
    dest: PathBuf,
) -> StageResult<ExtractedPackage> {
    let expected_hex = event.checksum_hex.clone();
    let expected_root = event.external_event_id.clone();
    let max_member = ctx.config.object_store.max_member_bytes;
    let max_total = ctx.config.object_store.max_archive_bytes;
    let require_self = ctx.config.processing.manifest_requires_self;

    blocking("checksum", move || {
        checksum::assert_envelope_format(&expected_hex)?;
        checksum::verify_archive_checksum(&archive_path, &expected_hex)?;
        let extracted =
            package::extract_package(&archive_path, &dest, &expected_root, max_member, max_total)?;
        checksum::verify_manifest(&extracted.root, require_self)?;
        Ok(extracted)
    })
    .await
}

/// One vector point per chunk, in `chunk_index` order.
fn build_points(
    enrichment: &Enrichment,
    conversation_id: Uuid,
    trace_id: Uuid,
) -> Vec<VectorPoint> {
    enrichment
        .chunks
        .iter()
        .zip(enrichment.vectors.iter())
        .map(|(chunk, vector)| VectorPoint {
            id: Uuid::new_v4(),
            vector: vector.clone(),
            payload: VectorPayload {
                conversation_id,
                speakers: chunk.speaker_ids.clone(),
                turn_range: chunk.turn_range.clone(),
                trace_id,
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
            },
        })
        .collect()
}

/// Assemble the relational rows from the document and its enrichment.
fn build_records(
    doc: &ConversationDocument,
    enrichment: &Enrichment,
    points: &[VectorPoint],
    conversation_id: Uuid,
    event: &IngestionEvent,
) -> (ConversationRecord, Vec<TurnRecord>) {
    // Map each segment to the first chunk that covers it, so turns can
    // reference their vector point.
    let segment_index: HashMap<&str, usize> = doc
        .segments
        .iter()
        .enumerate()
        .map(|(i, s)| (s.segment_id.as_str(), i))
        .collect();
    let mut point_by_segment: Vec<Option<Uuid>> = vec![None; doc.segments.len()];
    for (chunk, point) in enrichment.chunks.iter().zip(points.iter()) {
        let (first, last) = (&chunk.turn_range.0, &chunk.turn_range.1);
        if let (Some(&start), Some(&end)) = (
            segment_index.get(first.as_str()),
            segment_index.get(last.as_str()),
        ) {
            for slot in point_by_segment.iter_mut().take(end + 1).skip(start) {
                if slot.is_none() {
                    *slot = Some(point.id);
                }
            }
        }
    }

    let duration_sec = doc.meeting_metadata.duration_sec.map(|d| d as i64).or_else(|| {
        doc.meeting_metadata
            .end_at
            .map(|end| (end - doc.meeting_metadata.scheduled_start).num_seconds())
    });

    let conversation = ConversationRecord {
        id: conversation_id,
        external_event_id: doc.external_event_id.clone(),
        trace_id: event.trace_id,
        title: doc.meeting_metadata.title.clone(),
        date: doc.meeting_metadata.scheduled_start,
        duration_sec,
        language: doc.meeting_metadata.language.clone(),
        source_system: doc.source_system.clone(),
        participants: serde_json::to_value(&doc.participants)
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        topics: serde_json::to_value(
            enrichment
                .aggregates
                .top_persons
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>(),
        )
        .unwrap_or(serde_json::Value::Array(Vec::new())),
        aggregates: serde_json::to_value(&enrichment.aggregates)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        nlp_source: enrichment.nlp_source.as_str().to_string(),
        nlp_partial: enrichment.nlp_partial,
        chunk_count: enrichment.chunks.len() as i32,
        vector_point_ids: serde_json::to_value(
            points.iter().map(|p| p.id.to_string()).collect::<Vec<_>>(),
        )
        .unwrap_or(serde_json::Value::Array(Vec::new())),
    };

    let turns = doc
        .segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            let sentiment = enrichment.segment_sentiments.get(index).and_then(|s| *s);
            TurnRecord {
                id: Uuid::new_v4(),
                turn_index: index as i32,
                segment_id: segment.segment_id.clone(),
                speaker_id: segment.speaker_id.clone(),
                text: segment.text.clone(),
                start_ms: segment.start_ms,
                end_ms: segment.end_ms,
                language: segment.language.clone(),
                confidence: segment.confidence,
                sentiment: sentiment.map(|s| s.label.as_str().to_string()),
                sentiment_score: sentiment.map(|s| s.score),
                sentiment_stars: sentiment.map(|s| s.stars as i32),
                entities: enrichment
                    .segment_entities
                    .get(index)
                    .map(|e| serde_json::to_value(e).unwrap_or_default())
                    .unwrap_or(serde_json::Value::Array(Vec::new())),
                vector_point_id: point_by_segment[index],
            }
        })
        .collect();

    (conversation, turns)
}
