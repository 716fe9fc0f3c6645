//! Error taxonomy for the ingestion pipeline.
//!
//! Every pipeline stage returns a [`StageError`] carrying one of the
//! standardized [`ErrorCode`]s plus a human-readable message and an optional
//! cause. The codes are the cross-team contract: they drive the retry-vs-DLQ
//! decision in the error router, the `failures_total{reason}` metric labels,
//! and the `error_code` column operators triage on.
//!
//! # Error codes
//!
//! | Code | Retryable | Typical trigger |
//! |------|-----------|----------------|
//! | `validation_error` | no | envelope or document schema failure |
//! | `checksum_mismatch` | no | any of the three checksum checks |
//! | `unknown_schema_major` | no | unsupported `schema_version` |
//! | `duplicate_event` | no | job already in `completed` |
//! | `object_not_found` | no | missing package in store |
//! | `payload_too_large` | no | size caps exceeded |
//! | `object_store_unavailable` | yes | transport or 5xx from store |
//! | `persistence_failure` | yes | relational write failure |
//! | `vector_index_failure` | yes | vector store write failure |
//! | `nlp_partial` | n/a | non-fatal annotation failure |
//! | `ingestion_timeout` | yes | stage exceeded its deadline |
//! | `processing_failure` | yes | uncategorized failure |
//! | `cancelled` | no (ack) | graceful shutdown observed |
//! | `retry_exhausted` | no | retry cap reached on a retryable code |

use std::fmt;

/// Standardized error code shared across the job row, DLQ records, and
/// metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ValidationError,
    ChecksumMismatch,
    UnknownSchemaMajor,
    DuplicateEvent,
    ObjectNotFound,
    PayloadTooLarge,
    ObjectStoreUnavailable,
    PersistenceFailure,
    VectorIndexFailure,
    NlpPartial,
    IngestionTimeout,
    ProcessingFailure,
    Cancelled,
    RetryExhausted,
}

impl ErrorCode {
    /// Wire representation used in job rows, DLQ fields, and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::ChecksumMismatch => "checksum_mismatch",
            ErrorCode::UnknownSchemaMajor => "unknown_schema_major",
            ErrorCode::DuplicateEvent => "duplicate_event",
            ErrorCode::ObjectNotFound => "object_not_found",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::ObjectStoreUnavailable => "object_store_unavailable",
            ErrorCode::PersistenceFailure => "persistence_failure",
            ErrorCode::VectorIndexFailure => "vector_index_failure",
            ErrorCode::NlpPartial => "nlp_partial",
            ErrorCode::IngestionTimeout => "ingestion_timeout",
            ErrorCode::ProcessingFailure => "processing_failure",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::RetryExhausted => "retry_exhausted",
        }
    }

    /// Whether the broker should re-deliver the event for another attempt.
    ///
    /// Non-retryable codes are acked immediately (the payload will never
    /// become valid) and routed to the DLQ. `cancelled` is a special case:
    /// the entry is *released* un-acked so the event re-processes after the
    /// visibility timeout, but the router never counts it as a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ObjectStoreUnavailable
                | ErrorCode::PersistenceFailure
                | ErrorCode::VectorIndexFailure
                | ErrorCode::IngestionTimeout
                | ErrorCode::ProcessingFailure
        )
    }

    /// Operator-facing hint pointing at the responsible party.
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "Fix payload schema/format and republish within 24h",
            ErrorCode::ChecksumMismatch => {
                "Rebuild archive with correct checksums and republish"
            }
            ErrorCode::UnknownSchemaMajor => {
                "Producer emitted an unsupported schema major; coordinate a version rollout"
            }
            ErrorCode::DuplicateEvent => {
                "Investigate duplication; resend only if this is a new transcript"
            }
            ErrorCode::ObjectNotFound => {
                "Package missing or expired in object store; produce a fresh drop"
            }
            ErrorCode::PayloadTooLarge => {
                "Archive exceeds size caps; split the package or trim companion assets"
            }
            ErrorCode::ObjectStoreUnavailable
            | ErrorCode::PersistenceFailure
            | ErrorCode::VectorIndexFailure => {
                "Platform team investigating infrastructure issue"
            }
            ErrorCode::NlpPartial => {
                "Annotations incomplete; re-run enrichment once local models recover"
            }
            ErrorCode::IngestionTimeout | ErrorCode::ProcessingFailure => {
                "Automatic retry will occur; no action needed"
            }
            ErrorCode::Cancelled => "Worker shut down mid-flight; event re-delivers automatically",
            ErrorCode::RetryExhausted => {
                "Retry cap reached; contact platform team with the trace_id"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline stage failure: the classification plus context.
///
/// Stages construct these at the point of failure; the error router is the
/// only component that turns one into a retry-or-DLQ decision.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
    /// Underlying failure, kept for logging; not exposed as a std error
    /// source.
    pub cause: Option<anyhow::Error>,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn checksum(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ChecksumMismatch, message)
    }

    pub fn timeout(stage: &str, secs: f64) -> Self {
        Self::new(
            ErrorCode::IngestionTimeout,
            format!("stage '{stage}' exceeded its {secs}s deadline"),
        )
    }

    /// Upgrade a retryable failure whose retry budget is spent.
    ///
    /// The original code is preserved in the message so operators can see
    /// the underlying cause in the DLQ record.
    pub fn into_retry_exhausted(self) -> Self {
        Self {
            code: ErrorCode::RetryExhausted,
            message: format!("retry cap reached (cause: {}: {})", self.code, self.message),
            cause: self.cause,
        }
    }
}

/// Convenience alias used by every stage function.
pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_partition() {
        let retryable = [
            ErrorCode::ObjectStoreUnavailable,
            ErrorCode::PersistenceFailure,
            ErrorCode::VectorIndexFailure,
            ErrorCode::IngestionTimeout,
            ErrorCode::ProcessingFailure,
        ];
        for code in retryable {
            assert!(code.is_retryable(), "{code} should be retryable");
        }

        let terminal = [
            ErrorCode::ValidationError,
            ErrorCode::ChecksumMismatch,
            ErrorCode::UnknownSchemaMajor,
            ErrorCode::DuplicateEvent,
            ErrorCode::ObjectNotFound,
            ErrorCode::PayloadTooLarge,
            ErrorCode::Cancelled,
            ErrorCode::RetryExhausted,
        ];
        for code in terminal {
            assert!(!code.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn test_every_code_has_nonempty_hint() {
        let all = [
            ErrorCode::ValidationError,
            ErrorCode::ChecksumMismatch,
            ErrorCode::UnknownSchemaMajor,
            ErrorCode::DuplicateEvent,
            ErrorCode::ObjectNotFound,
            ErrorCode::PayloadTooLarge,
            ErrorCode::ObjectStoreUnavailable,
            ErrorCode::PersistenceFailure,
            ErrorCode::VectorIndexFailure,
            ErrorCode::NlpPartial,
            ErrorCode::IngestionTimeout,
            ErrorCode::ProcessingFailure,
            ErrorCode::Cancelled,
            ErrorCode::RetryExhausted,
        ];
        for code in all {
            assert!(!code.remediation_hint().is_empty());
            assert!(!code.as_str().is_empty());
        }
    }

    #[test]
    fn test_retry_exhausted_preserves_cause() {
        let err = StageError::new(ErrorCode::PersistenceFailure, "connection reset");
        let upgraded = err.into_retry_exhausted();
        assert_eq!(upgraded.code, ErrorCode::RetryExhausted);
        assert!(upgraded.message.contains("persistence_failure"));
        assert!(upgraded.message.contains("connection reset"));
    }
}
