//! Error router: the single retry-vs-DLQ decision point.
//!
//! Every stage failure funnels through here exactly once. The pure
//! [`decide`] function maps `(error code, attempt, retry cap)` onto a
//! [`Disposition`]; [`ErrorRouter::handle`] applies the side effects in
//! order: failure metrics, job-row error columns, and the best-effort DLQ
//! append. A DLQ write failure is logged and never blocks the ack
//! decision.
//!
//! Decision rules:
//! - `duplicate_event` → ack, counted on the duplicates series only.
//! - `cancelled` → release un-acked with no DLQ record; the event
//!   re-delivers after the visibility timeout and duplicate detection
//!   keeps the replay safe.
//! - retryable code below the cap → release un-acked (broker-driven
//!   backoff, no sleeping here).
//! - retryable code at the cap → upgraded to `retry_exhausted`, acked,
//!   dead-lettered.
//! - non-retryable code → acked, dead-lettered.

use chrono::Utc;
use redis::AsyncCommands;
use tracing::{error, warn};

use crate::error::{ErrorCode, StageError};
use crate::event::IngestionEvent;
use crate::metrics;
use crate::store::Store;

/// What the consumer should do with the stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Ack and move on; the work already exists.
    AckDuplicate,
    /// Leave un-acked so the broker re-delivers.
    Release,
    /// Release un-acked because of shutdown; not a failure.
    ReleaseCancelled,
    /// Ack and append to the dead-letter stream.
    DeadLetter,
}

impl Disposition {
    pub fn should_ack(&self) -> bool {
        matches!(self, Disposition::AckDuplicate | Disposition::DeadLetter)
    }
}

/// Pure decision function. `attempt` counts processing attempts already
/// spent on this event (0 for the first try).
pub fn decide(code: ErrorCode, attempt: u32, max_retries: u32) -> Disposition {
    match code {
        ErrorCode::DuplicateEvent => Disposition::AckDuplicate,
        ErrorCode::Cancelled => Disposition::ReleaseCancelled,
        _ if code.is_retryable() && attempt < max_retries => Disposition::Release,
        _ => Disposition::DeadLetter,
    }
}

pub struct ErrorRouter {
    dlq_stream: String,
    max_retries: u32,
}

impl ErrorRouter {
    pub fn new(dlq_stream: String, max_retries: u32) -> Self {
        Self {
            dlq_stream,
            max_retries,
        }
    }

    /// Route one failure. Returns the disposition after all side effects
    /// (metrics, job row, DLQ) have been attempted.
    pub async fn handle(
        &self,
        redis: &mut redis::aio::ConnectionManager,
        store: &Store,
        event: Option<&IngestionEvent>,
        raw_fields: &[(String, String)],
        job_id: Option<uuid::Uuid>,
        attempt: u32,
        error: StageError,
    ) -> Disposition {
        let disposition = decide(error.code, attempt, self.max_retries);

        // Upgrade the classification when the retry budget is spent.
        let error = match disposition {
            Disposition::DeadLetter if error.code.is_retryable() => error.into_retry_exhausted(),
            _ => error,
        };

        let trace_id = event.map(|e| e.trace_id.to_string());
        match disposition {
            Disposition::AckDuplicate => {
                metrics::record_duplicate();
            }
            Disposition::ReleaseCancelled => {}
            Disposition::Release => {
                metrics::record_failure(error.code);
                metrics::record_retry(error.code);
            }
            Disposition::DeadLetter => {
                metrics::record_failure(error.code);
            }
        }

        if disposition == Disposition::AckDuplicate {
            return disposition;
        }

        warn!(
            trace_id = trace_id.as_deref().unwrap_or("unknown"),
            error_code = error.code.as_str(),
            attempt,
            disposition = ?disposition,
            "pipeline failure: {}",
            error.message
        );

        if let Some(job_id) = job_id {
            let terminal = disposition == Disposition::DeadLetter;
            if let Err(db_err) = store
                .record_failure(job_id, error.code.as_str(), &error.message, terminal)
                .await
            {
                error!(
                    job_id = %job_id,
                    "failed to record error on job row: {db_err}"
                );
            }
        }

        if disposition == Disposition::DeadLetter {
            let fields = build_dlq_fields(event, raw_fields, &error, attempt);
            match self.publish_dlq(redis, &fields).await {
                Ok(()) => metrics::record_dlq_published(),
                // Best-effort: the ack decision stands either way.
                Err(publish_err) => error!(
                    trace_id = trace_id.as_deref().unwrap_or("unknown"),
                    "DLQ publish failed: {publish_err}"
                ),
            }
        }

        disposition
    }

    async fn publish_dlq(
        &self,
        redis: &mut redis::aio::ConnectionManager,
        fields: &[(String, String)],
    ) -> redis::RedisResult<()> {
        let _: String = redis.xadd(&self.dlq_stream, "*", fields).await?;
        Ok(())
    }
}

/// Assemble the DLQ record: classification, remediation, context, and the
/// original envelope fields for replay.
pub fn build_dlq_fields(
    event: Option<&IngestionEvent>,
    raw_fields: &[(String, String)],
    error: &StageError,
    attempt: u32,
) -> Vec<(String, String)> {
    let mut fields = vec![
        ("error_code".to_string(), error.code.as_str().to_string()),
        ("error_message".to_string(), error.message.clone()),
        (
            "remediation_hint".to_string(),
            error.code.remediation_hint().to_string(),
        ),
        ("failed_at".to_string(), Utc::now().to_rfc3339()),
        ("attempt_count".to_string(), attempt.to_string()),
        (
            "trace_id".to_string(),
            event
                .map(|e| e.trace_id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ),
    ];

    // Prefer the validated envelope; fall back to the raw entry when the
    // event never parsed.
    let original = match event {
        Some(event) => event.to_flat_fields(),
        None => raw_fields.to_vec(),
    };
    for (key, value) in original {
        if fields.iter().any(|(k, _)| *k == key) {
            continue;
        }
        fields.push((key, value));
    }

    fields
}
