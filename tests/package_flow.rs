//! End-to-end coverage of the offline pipeline stages: a real tar.gz
//! package fixture goes through envelope parsing, archive checksum
//! verification, extraction, manifest verification, document validation,
//! mode detection, chunking, and aggregate computation — everything that
//! runs between broker delivery and the first network write.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use rag_ingest::checksum;
use rag_ingest::chunking::{choose_strategy, chunk_segments, ChunkStrategy};
use rag_ingest::document::ConversationDocument;
use rag_ingest::enrich::{compute_aggregates, detect_mode, NlpSource};
use rag_ingest::error::ErrorCode;
use rag_ingest::event::parse_event;
use rag_ingest::package::extract_package;
use rag_ingest::validate::{parse_document, validate_document};

const EVENT_ID: &str = "rec-20251003T091500Z-3f9c4241";
const TRACE_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn conversation_json() -> String {
    serde_json::json!({
        "schema_version": "1.1",
        "external_event_id": EVENT_ID,
        "source_system": "transcript-service",
        "created_at": "2025-10-03T09:15:00Z",
        "meeting_metadata": {
            "scheduled_start": "2025-10-03T09:00:00Z",
            "duration_sec": 1800,
            "title": "Point hebdo",
            "language": "fr"
        },
        "participants": [
            {"speaker_id": "spk-1", "display_name": "Alice"},
            {"speaker_id": "spk-2", "display_name": "Jean"}
        ],
        "segments": [
            {
                "segment_id": "seg-0",
                "speaker_id": "spk-1",
                "start_ms": 0,
                "end_ms": 4200,
                "text": "Bonjour Jean, comment vas-tu ?",
                "language": "fr",
                "confidence": 0.97,
                "annotations": {
                    "sentiment": {"label": "positive", "score": 0.91, "stars": 4},
                    "entities": [{"type": "PERSON", "text": "Jean"}]
                }
            },
            {
                "segment_id": "seg-1",
                "speaker_id": "spk-2",
                "start_ms": 4200,
                "end_ms": 9100,
                "text": "Très bien merci, je travaille chez Google maintenant.",
                "language": "fr",
                "confidence": 0.94,
                "annotations": {
                    "sentiment": {"label": "very_positive", "score": 0.88, "stars": 5},
                    "entities": [{"type": "ORGANIZATION", "text": "Google"}]
                }
            },
            {
                "segment_id": "seg-2",
                "speaker_id": "spk-1",
                "start_ms": 9100,
                "end_ms": 15000,
                "text": "Super nouvelle, il faudra fêter ça avec Marie.",
                "language": "fr",
                "confidence": 0.95,
                "annotations": {
                    "sentiment": {"label": "positive", "score": 0.85, "stars": 4},
                    "entities": [{"type": "PERSON", "text": "Marie"}]
                }
            }
        ]
    })
    .to_string()
}

fn hex_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build a contract-conforming package archive; returns its path and the
/// envelope checksum.
fn build_package(dir: &Path) -> (PathBuf, String) {
    let doc = conversation_json();
    let media = b"not really ogg bytes";

    let manifest = format!(
        "{}  conversation.json\n{}  media/audio.ogg\n{}  checksums.sha256\n",
        hex_digest(doc.as_bytes()),
        hex_digest(media),
        "0".repeat(64),
    );

    let archive_path = dir.join("package.tar.gz");
    let file = std::fs::File::create(&archive_path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let entries: Vec<(String, &[u8])> = vec![
        (format!("{EVENT_ID}/conversation.json"), doc.as_bytes()),
        (format!("{EVENT_ID}/checksums.sha256"), manifest.as_bytes()),
        (format!("{EVENT_ID}/media/audio.ogg"), media),
    ];
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder
        .into_inner()
        .unwrap()
        .finish()
        .unwrap()
        .flush()
        .unwrap();

    let archive_bytes = std::fs::read(&archive_path).unwrap();
    (archive_path, hex_digest(&archive_bytes))
}

fn envelope(checksum_hex: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert("external_event_id".into(), EVENT_ID.into());
    fields.insert(
        "package_uri".into(),
        format!("minio://ingestion/drop/2025/10/03/{EVENT_ID}.tar.gz"),
    );
    fields.insert("checksum".into(), format!("sha256:{checksum_hex}"));
    fields.insert("schema_version".into(), "1.1".into());
    fields.insert("retry_count".into(), "0".into());
    fields.insert("produced_at".into(), "2025-10-03T09:16:00Z".into());
    fields.insert(
        "producer".into(),
        r#"{"service":"transcript-svc","instance":"tx-1"}"#.into(),
    );
    fields.insert(
        "metadata".into(),
        format!(r#"{{"trace_id":"{TRACE_ID}"}}"#),
    );
    fields
}

#[test]
fn test_full_offline_flow_enriched_package() {
    let tmp = TempDir::new().unwrap();
    let (archive, checksum_hex) = build_package(tmp.path());

    // C2: envelope.
    let event = parse_event(&envelope(&checksum_hex), &[1]).unwrap();
    assert_eq!(event.bucket, "ingestion");
    assert_eq!(event.trace_id.to_string(), TRACE_ID);

    // C4: archive digest matches the envelope.
    checksum::assert_envelope_format(&event.checksum_hex).unwrap();
    checksum::verify_archive_checksum(&archive, &event.checksum_hex).unwrap();

    // C3: extraction honors the layout contract.
    let dest = TempDir::new().unwrap();
    let extracted = extract_package(
        &archive,
        dest.path(),
        &event.external_event_id,
        u64::MAX,
        u64::MAX,
    )
    .unwrap();
    assert_eq!(extracted.file_count, 3);

    // C4: manifest verification (self-listing required — the fixture
    // lists itself).
    let verified = checksum::verify_manifest(&extracted.root, true).unwrap();
    assert_eq!(verified, 2);

    // C5: document validation.
    let bytes = std::fs::read(extracted.conversation_json()).unwrap();
    let doc: ConversationDocument = parse_document(&bytes).unwrap();
    validate_document(&doc, &event.external_event_id, &[1]).unwrap();

    // C6: mode detection and chunking.
    assert_eq!(detect_mode(&doc, true), NlpSource::Upstream);
    let strategy = choose_strategy(doc.participants.len(), &doc.segments);
    assert_eq!(strategy, ChunkStrategy::TurnBased);
    let chunks = chunk_segments(&doc.segments, strategy);
    assert!(!chunks.is_empty());
    assert_eq!(chunks[0].chunk_index, 0);

    // Aggregates from the upstream annotations.
    let sentiments: Vec<_> = doc
        .segments
        .iter()
        .map(|s| {
            s.annotations.as_ref().and_then(|a| a.sentiment.as_ref()).map(|sa| {
                rag_ingest::enrich::SegmentSentiment {
                    label: sa.label,
                    stars: sa.stars(),
                    score: sa.score,
                }
            })
        })
        .collect();
    let entities: Vec<_> = doc
        .segments
        .iter()
        .map(|s| {
            s.annotations
                .as_ref()
                .map(|a| a.entities.clone())
                .unwrap_or_default()
        })
        .collect();
    let aggregates = compute_aggregates(&sentiments, &entities);
    assert_eq!(aggregates.sentiment_distribution["positive"], 2);
    assert_eq!(aggregates.sentiment_distribution["very_positive"], 1);
    assert!((aggregates.avg_stars.unwrap() - 13.0 / 3.0).abs() < 1e-9);
    assert_eq!(aggregates.entity_type_counts["PERSON"], 2);
    assert_eq!(aggregates.entity_type_counts["ORGANIZATION"], 1);
    assert_eq!(aggregates.top_persons.len(), 2);
}

#[test]
fn test_tampered_archive_fails_checksum() {
    let tmp = TempDir::new().unwrap();
    let (archive, checksum_hex) = build_package(tmp.path());

    // Append a byte after the checksum was taken.
    let mut bytes = std::fs::read(&archive).unwrap();
    bytes.push(0x00);
    std::fs::write(&archive, &bytes).unwrap();

    let err = checksum::verify_archive_checksum(&archive, &checksum_hex).unwrap_err();
    assert_eq!(err.code, ErrorCode::ChecksumMismatch);
}

#[test]
fn test_tampered_member_fails_manifest() {
    let tmp = TempDir::new().unwrap();
    let (archive, _) = build_package(tmp.path());

    let dest = TempDir::new().unwrap();
    let extracted =
        extract_package(&archive, dest.path(), EVENT_ID, u64::MAX, u64::MAX).unwrap();

    std::fs::write(extracted.root.join("media/audio.ogg"), b"tampered").unwrap();
    let err = checksum::verify_manifest(&extracted.root, true).unwrap_err();
    assert_eq!(err.code, ErrorCode::ChecksumMismatch);
}

#[test]
fn test_envelope_checksum_format_mismatch_rejected_before_io() {
    // A well-formed envelope whose digest simply differs still parses;
    // the mismatch only surfaces at verification time.
    let tmp = TempDir::new().unwrap();
    let (archive, _) = build_package(tmp.path());

    let wrong = "b".repeat(64);
    let event = parse_event(&envelope(&wrong), &[1]).unwrap();
    let err = checksum::verify_archive_checksum(&archive, &event.checksum_hex).unwrap_err();
    assert_eq!(err.code, ErrorCode::ChecksumMismatch);
}

#[test]
fn test_document_speaker_coverage_checked_after_extraction() {
    let tmp = TempDir::new().unwrap();
    let (archive, _) = build_package(tmp.path());
    let dest = TempDir::new().unwrap();
    let extracted =
        extract_package(&archive, dest.path(), EVENT_ID, u64::MAX, u64::MAX).unwrap();

    let bytes = std::fs::read(extracted.conversation_json()).unwrap();
    let mut doc = parse_document(&bytes).unwrap();
    doc.participants.retain(|p| p.speaker_id != "spk-2");
    let err = validate_document(&doc, EVENT_ID, &[1]).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[test]
fn test_legacy_mode_when_annotations_stripped() {
    let tmp = TempDir::new().unwrap();
    let (archive, _) = build_package(tmp.path());
    let dest = TempDir::new().unwrap();
    let extracted =
        extract_package(&archive, dest.path(), EVENT_ID, u64::MAX, u64::MAX).unwrap();

    let bytes = std::fs::read(extracted.conversation_json()).unwrap();
    let mut doc = parse_document(&bytes).unwrap();
    for segment in &mut doc.segments {
        segment.annotations = None;
    }
    assert_eq!(detect_mode(&doc, true), NlpSource::Local);
    assert_eq!(detect_mode(&doc, false), NlpSource::None);
}
