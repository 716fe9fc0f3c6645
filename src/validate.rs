//! Payload validation: structural parse plus semantic invariants.
//!
//! [`parse_document`] turns the raw `conversation.json` bytes into a
//! [`ConversationDocument`]; [`validate_document`] then enforces everything
//! the shape alone cannot express: identifier agreement with the archive,
//! time bounds, confidence ranges, speaker coverage, and version
//! acceptance. All failures map to `validation_error` except an unknown
//! schema major.

use std::collections::HashSet;

use tracing::warn;

use crate::document::ConversationDocument;
use crate::error::{ErrorCode, StageError, StageResult};

/// Language codes the platform ingests today.
const KNOWN_LANGUAGES: &[&str] = &["fr", "en", "es", "de", "it", "pt"];

/// Parse `conversation.json` bytes into a document.
///
/// The file contract is UTF-8 without a byte-order mark; a BOM is a
/// producer bug we reject rather than silently strip.
pub fn parse_document(bytes: &[u8]) -> StageResult<ConversationDocument> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Err(StageError::validation(
            "conversation.json starts with a UTF-8 BOM",
        ));
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|e| StageError::validation(format!("conversation.json is not UTF-8: {e}")))?;

    serde_json::from_str(text).map_err(|e| {
        StageError::validation(format!("conversation.json failed schema validation: {e}"))
    })
}

/// Enforce the semantic invariants of a parsed document.
///
/// `expected_event_id` is the envelope's identifier, which must equal both
/// the archive's top-level directory (checked during extraction) and the
/// document's own `external_event_id`.
pub fn validate_document(
    doc: &ConversationDocument,
    expected_event_id: &str,
    known_majors: &[u32],
) -> StageResult<()> {
    let version = doc.schema_version().ok_or_else(|| {
        StageError::validation(format!(
            "document schema_version '{}' is not a major.minor version",
            doc.schema_version
        ))
    })?;
    if !known_majors.contains(&version.major) {
        return Err(StageError::new(
            ErrorCode::UnknownSchemaMajor,
            format!("document schema major {} is not accepted", version.major),
        ));
    }

    if doc.external_event_id != expected_event_id {
        return Err(StageError::validation(format!(
            "document external_event_id '{}' does not match envelope '{}'",
            doc.external_event_id, expected_event_id
        )));
    }

    if doc.meeting_metadata.duration_sec.is_none() && doc.meeting_metadata.end_at.is_none() {
        return Err(StageError::validation(
            "meeting_metadata needs either duration_sec or end_at",
        ));
    }

    if doc.segments.is_empty() {
        return Err(StageError::validation("document has no segments"));
    }

    let speaker_ids: HashSet<&str> = doc
        .participants
        .iter()
        .map(|p| p.speaker_id.as_str())
        .collect();

    for segment in &doc.segments {
        let id = &segment.segment_id;
        if segment.start_ms < 0 {
            return Err(StageError::validation(format!(
                "segment '{id}' has negative start_ms {}",
                segment.start_ms
            )));
        }
        // start_ms == end_ms is legal (zero-length interjections).
        if segment.start_ms > segment.end_ms {
            return Err(StageError::validation(format!(
                "segment '{id}' has start_ms {} after end_ms {}",
                segment.start_ms, segment.end_ms
            )));
        }
        if !(0.0..=1.0).contains(&segment.confidence) {
            return Err(StageError::validation(format!(
                "segment '{id}' confidence {} outside [0, 1]",
                segment.confidence
            )));
        }
        if segment.text.trim().is_empty() {
            return Err(StageError::validation(format!(
                "segment '{id}' has empty text"
            )));
        }
        if !KNOWN_LANGUAGES.contains(&segment.language.as_str()) {
            return Err(StageError::validation(format!(
                "segment '{id}' has unknown language '{}'",
                segment.language
            )));
        }
        if !speaker_ids.contains(segment.speaker_id.as_str()) {
            return Err(StageError::validation(format!(
                "segment '{id}' speaker '{}' not listed in participants",
                segment.speaker_id
            )));
        }
    }

    if !doc.extra.is_empty() {
        let keys: Vec<&str> = doc.extra.keys().map(String::as_str).collect();
        warn!(
            external_event_id = %doc.external_event_id,
            unknown_keys = ?keys,
            "document carries unknown top-level keys (preserved)"
        );
    }

    Ok(())
}
