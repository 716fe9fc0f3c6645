//! Canonical conversation document model.
//!
//! These types mirror `conversation.json` as produced by the transcription
//! service. Deserialization is deliberately permissive about *extra* keys
//! (captured in `extra` maps and preserved for downstream consumers) and
//! strict about the shape of the keys it knows. Semantic invariants beyond
//! the shape live in [`crate::validate`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::SchemaVersion;

/// Top-level conversation document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDocument {
    pub schema_version: String,
    pub external_event_id: String,
    pub source_system: String,
    pub created_at: DateTime<Utc>,
    pub meeting_metadata: MeetingMetadata,
    pub participants: Vec<Participant>,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_flags: Option<serde_json::Value>,
    /// Unknown top-level keys: warned about, preserved for forwarding.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConversationDocument {
    pub fn schema_version(&self) -> Option<SchemaVersion> {
        SchemaVersion::parse(&self.schema_version)
    }

    /// Whether any segment carries a non-empty upstream annotation.
    pub fn has_upstream_annotations(&self) -> bool {
        self.segments.iter().any(|segment| {
            segment
                .annotations
                .as_ref()
                .map(|a| a.sentiment.is_some() || !a.entities.is_empty())
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingMetadata {
    pub scheduled_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub speaker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One speaker turn with text and time bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub speaker_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    /// Upstream NLP annotations, v1.1+ only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<EntityAnnotation>,
}

/// Five-label sentiment scale shared by upstream annotations and the local
/// analyzer. `Mixed` only ever comes from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
    Mixed,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::VeryNegative => "very_negative",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Positive => "positive",
            SentimentLabel::VeryPositive => "very_positive",
            SentimentLabel::Mixed => "mixed",
        }
    }

    /// Map a 1–5 star rating onto the label scale.
    pub fn from_stars(stars: u8) -> Self {
        match stars {
            0 | 1 => SentimentLabel::VeryNegative,
            2 => SentimentLabel::Negative,
            3 => SentimentLabel::Neutral,
            4 => SentimentLabel::Positive,
            _ => SentimentLabel::VeryPositive,
        }
    }

    /// Representative star value, used when upstream omits `stars`.
    pub fn to_stars(&self) -> u8 {
        match self {
            SentimentLabel::VeryNegative => 1,
            SentimentLabel::Negative => 2,
            SentimentLabel::Neutral | SentimentLabel::Mixed => 3,
            SentimentLabel::Positive => 4,
            SentimentLabel::VeryPositive => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentAnnotation {
    pub label: SentimentLabel,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stars: Option<u8>,
}

impl SentimentAnnotation {
    pub fn stars(&self) -> u8 {
        self.stars.unwrap_or_else(|| self.label.to_stars())
    }
}

/// Named entity classes recognized across upstream and local extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Location,
    Organization,
    Date,
    Time,
    Money,
    Misc,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Location => "LOCATION",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Date => "DATE",
            EntityType::Time => "TIME",
            EntityType::Money => "MONEY",
            EntityType::Misc => "MISC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAnnotation {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_document_json() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "1.1",
            "external_event_id": "rec-20251003T091500Z-3f9c4241",
            "source_system": "transcript-service",
            "created_at": "2025-10-03T09:15:00Z",
            "meeting_metadata": {
                "scheduled_start": "2025-10-03T09:00:00Z",
                "duration_sec": 1800,
                "title": "Weekly sync"
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
                        "entities": [
                            {"type": "PERSON", "text": "Jean", "start_char": 8, "end_char": 12}
                        ]
                    }
                },
                {
                    "segment_id": "seg-1",
                    "speaker_id": "spk-2",
                    "start_ms": 4200,
                    "end_ms": 9100,
                    "text": "Très bien merci, je travaille chez Google maintenant.",
                    "language": "fr",
                    "confidence": 0.94
                }
            ]
        })
    }

    #[test]
    fn test_deserialize_sample() {
        let doc: ConversationDocument =
            serde_json::from_value(sample_document_json()).unwrap();
        assert_eq!(doc.external_event_id, "rec-20251003T091500Z-3f9c4241");
        assert_eq!(doc.segments.len(), 2);
        assert_eq!(doc.participants.len(), 2);
        let ann = doc.segments[0].annotations.as_ref().unwrap();
        assert_eq!(ann.sentiment.as_ref().unwrap().label, SentimentLabel::Positive);
        assert_eq!(ann.entities[0].entity_type, EntityType::Person);
    }

    #[test]
    fn test_unknown_top_level_keys_preserved() {
        let mut json = sample_document_json();
        json["custom_pipeline_tag"] = serde_json::json!("beta");
        let doc: ConversationDocument = serde_json::from_value(json).unwrap();
        assert_eq!(
            doc.extra.get("custom_pipeline_tag").and_then(|v| v.as_str()),
            Some("beta")
        );
        // And they survive re-serialization.
        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["custom_pipeline_tag"], "beta");
    }

    #[test]
    fn test_has_upstream_annotations() {
        let doc: ConversationDocument =
            serde_json::from_value(sample_document_json()).unwrap();
        assert!(doc.has_upstream_annotations());

        let mut stripped = doc.clone();
        for segment in &mut stripped.segments {
            segment.annotations = None;
        }
        assert!(!stripped.has_upstream_annotations());

        // An empty annotations object does not count as enriched.
        stripped.segments[0].annotations = Some(Annotations::default());
        assert!(!stripped.has_upstream_annotations());
    }

    #[test]
    fn test_stars_label_round_trip() {
        assert_eq!(SentimentLabel::from_stars(1), SentimentLabel::VeryNegative);
        assert_eq!(SentimentLabel::from_stars(3), SentimentLabel::Neutral);
        assert_eq!(SentimentLabel::from_stars(5), SentimentLabel::VeryPositive);
        for stars in 1..=5u8 {
            assert_eq!(SentimentLabel::from_stars(stars).to_stars(), stars);
        }
    }

    #[test]
    fn test_missing_required_segment_field_fails() {
        let mut json = sample_document_json();
        json["segments"][0].as_object_mut().unwrap().remove("text");
        assert!(serde_json::from_value::<ConversationDocument>(json).is_err());
    }
}
