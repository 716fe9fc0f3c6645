//! Event envelope parsing and validation.
//!
//! Decodes the flat string map read from the ingestion stream into a typed
//! [`IngestionEvent`]. This stage performs no I/O: every check here is pure
//! (field presence, identifier and checksum formats, schema-major
//! acceptance, URI splitting, trace extraction). Anything that fails maps
//! to `validation_error`, except an unsupported schema major which gets its
//! own `unknown_schema_major` code.
//!
//! The `producer` and `metadata` fields arrive JSON-encoded inside the flat
//! map; unknown metadata keys are preserved for DLQ forwarding but never
//! dispatched on — the only recognized key is `trace_id`.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorCode, StageError, StageResult};

fn event_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^rec-\d{8}T\d{6}Z-[a-f0-9]{8}$").expect("static regex"))
}

fn checksum_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("static regex"))
}

/// `major.minor` schema version from the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let (major, minor) = raw.split_once('.')?;
        // Reject anything beyond two numeric components ("1.1.3", "1.x").
        if major.is_empty() || minor.is_empty() {
            return None;
        }
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// v1.1 introduced upstream NLP annotations on segments.
    pub fn supports_annotations(&self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 1)
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Producer identity from the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Producer {
    pub service: String,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// A fully validated ingestion event.
///
/// Construction goes through [`parse_event`]; a value of this type implies
/// every envelope-level invariant already holds.
#[derive(Debug, Clone)]
pub struct IngestionEvent {
    /// Stable per-conversation identifier; dedup key.
    pub external_event_id: String,
    /// Original URI as received, kept for the job row and DLQ records.
    pub package_uri: String,
    pub bucket: String,
    pub object_key: String,
    /// 64 lowercase hex chars, `sha256:` prefix stripped.
    pub checksum_hex: String,
    pub schema_version: SchemaVersion,
    pub retry_count: u32,
    pub produced_at: DateTime<Utc>,
    pub producer: Option<Producer>,
    pub priority: Priority,
    /// Correlation id propagated into every log line, row, and payload.
    pub trace_id: Uuid,
    /// Remaining metadata keys, preserved verbatim for forwarding.
    pub metadata_extra: HashMap<String, serde_json::Value>,
}

impl IngestionEvent {
    /// Flat field representation for re-publishing (DLQ records carry the
    /// original envelope fields alongside the error classification).
    pub fn to_flat_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("external_event_id".into(), self.external_event_id.clone()),
            ("package_uri".into(), self.package_uri.clone()),
            ("checksum".into(), format!("sha256:{}", self.checksum_hex)),
            ("schema_version".into(), self.schema_version.to_string()),
            ("retry_count".into(), self.retry_count.to_string()),
            ("produced_at".into(), self.produced_at.to_rfc3339()),
            ("priority".into(), self.priority.as_str().to_string()),
        ];
        if let Some(producer) = &self.producer {
            if let Ok(json) = serde_json::to_string(producer) {
                fields.push(("producer".into(), json));
            }
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "trace_id".into(),
            serde_json::Value::String(self.trace_id.to_string()),
        );
        for (k, v) in &self.metadata_extra {
            metadata.insert(k.clone(), v.clone());
        }
        fields.push((
            "metadata".into(),
            serde_json::Value::Object(metadata).to_string(),
        ));
        fields
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> StageResult<&'a str> {
    fields
        .get(key)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StageError::validation(format!("missing required field '{key}'")))
}

/// Split `<scheme>://<bucket>/<object-key>` into its components.
fn split_package_uri(uri: &str) -> StageResult<(String, String)> {
    let rest = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| StageError::validation(format!("package_uri '{uri}' has no scheme")))?;

    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| StageError::validation(format!("package_uri '{uri}' has no object key")))?;

    if bucket.is_empty() {
        return Err(StageError::validation(format!(
            "package_uri '{uri}' has an empty bucket"
        )));
    }
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(StageError::validation(format!(
            "package_uri '{uri}' has an empty object key"
        )));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Parse and validate a raw stream entry.
///
/// `known_majors` is the configured set of accepted schema majors; an
/// otherwise well-formed version outside it fails with
/// `unknown_schema_major` so the router never retries it.
pub fn parse_event(
    fields: &HashMap<String, String>,
    known_majors: &[u32],
) -> StageResult<IngestionEvent> {
    let external_event_id = required(fields, "external_event_id")?.to_string();
    if !event_id_re().is_match(&external_event_id) {
        return Err(StageError::validation(format!(
            "external_event_id '{external_event_id}' does not match rec-<timestamp>-<hex8>"
        )));
    }

    let package_uri = required(fields, "package_uri")?.to_string();
    let (bucket, object_key) = split_package_uri(&package_uri)?;

    let checksum = required(fields, "checksum")?;
    if !checksum_re().is_match(checksum) {
        return Err(StageError::validation(format!(
            "checksum '{checksum}' must be 'sha256:' + 64 lowercase hex characters"
        )));
    }
    let checksum_hex = checksum.trim_start_matches("sha256:").to_string();

    let version_raw = required(fields, "schema_version")?;
    let schema_version = SchemaVersion::parse(version_raw).ok_or_else(|| {
        StageError::validation(format!(
            "schema_version '{version_raw}' is not a major.minor version"
        ))
    })?;
    if !known_majors.contains(&schema_version.major) {
        return Err(StageError::new(
            ErrorCode::UnknownSchemaMajor,
            format!(
                "schema major {} not in accepted set {known_majors:?}",
                schema_version.major
            ),
        ));
    }

    let retry_count: u32 = required(fields, "retry_count")?
        .parse()
        .map_err(|_| StageError::validation("retry_count is not a non-negative integer"))?;
    if retry_count > 10 {
        return Err(StageError::validation(format!(
            "retry_count {retry_count} exceeds the bound of 10"
        )));
    }

    let produced_at = DateTime::parse_from_rfc3339(required(fields, "produced_at")?)
        .map_err(|e| StageError::validation(format!("produced_at is not a UTC instant: {e}")))?
        .with_timezone(&Utc);

    let producer: Option<Producer> = match fields.get("producer") {
        Some(raw) if !raw.is_empty() => Some(
            serde_json::from_str(raw)
                .map_err(|e| StageError::validation(format!("producer is not valid JSON: {e}")))?,
        ),
        _ => None,
    };

    let priority = match fields.get("priority").map(|s| s.as_str()) {
        None | Some("normal") => Priority::Normal,
        Some("high") => Priority::High,
        Some(other) => {
            return Err(StageError::validation(format!(
                "priority '{other}' is not 'normal' or 'high'"
            )))
        }
    };

    let metadata_raw = required(fields, "metadata")?;
    let mut metadata: HashMap<String, serde_json::Value> = serde_json::from_str(metadata_raw)
        .map_err(|e| StageError::validation(format!("metadata is not a JSON object: {e}")))?;

    let trace_id = metadata
        .remove("trace_id")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| StageError::validation("metadata is missing required key 'trace_id'"))?;
    let trace_id = Uuid::parse_str(&trace_id)
        .map_err(|e| StageError::validation(format!("trace_id is not a UUID: {e}")))?;

    // Event ids carry their production timestamp; an id more than 24h in
    // the future is tolerated as clock skew, not rejected.
    if let Some(skew) = embedded_timestamp(&external_event_id)
        .filter(|ts| *ts > Utc::now() + Duration::hours(24))
    {
        warn!(
            external_event_id = %external_event_id,
            embedded_at = %skew,
            "event id timestamp is more than 24h in the future (clock skew?)"
        );
    }

    Ok(IngestionEvent {
        external_event_id,
        package_uri,
        bucket,
        object_key,
        checksum_hex,
        schema_version,
        retry_count,
        produced_at,
        producer,
        priority,
        trace_id,
        metadata_extra: metadata,
    })
}

/// Extract the `YYYYMMDDTHHMMSSZ` timestamp embedded in a valid event id.
fn embedded_timestamp(external_event_id: &str) -> Option<DateTime<Utc>> {
    let stamp = external_event_id
        .strip_prefix("rec-")?
        .split('-')
        .next()?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_fields() -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert(
            "external_event_id".into(),
            "rec-20251003T091500Z-3f9c4241".into(),
        );
        fields.insert(
            "package_uri".into(),
            "minio://ingestion/drop/2025/10/03/rec-20251003T091500Z-3f9c4241.tar.gz".into(),
        );
        fields.insert("checksum".into(), format!("sha256:{}", "a".repeat(64)));
        fields.insert("schema_version".into(), "1.1".into());
        fields.insert("retry_count".into(), "0".into());
        fields.insert("produced_at".into(), "2025-10-03T09:16:00Z".into());
        fields.insert(
            "producer".into(),
            r#"{"service":"transcript-svc","instance":"tx-2"}"#.into(),
        );
        fields.insert("priority".into(), "normal".into());
        fields.insert(
            "metadata".into(),
            r#"{"trace_id":"550e8400-e29b-41d4-a716-446655440000","region":"eu-west-1"}"#.into(),
        );
        fields
    }

    #[test]
    fn test_parse_valid_event() {
        let event = parse_event(&valid_fields(), &[1]).unwrap();
        assert_eq!(event.external_event_id, "rec-20251003T091500Z-3f9c4241");
        assert_eq!(event.bucket, "ingestion");
        assert_eq!(
            event.object_key,
            "drop/2025/10/03/rec-20251003T091500Z-3f9c4241.tar.gz"
        );
        assert_eq!(event.checksum_hex.len(), 64);
        assert_eq!(event.schema_version, SchemaVersion { major: 1, minor: 1 });
        assert_eq!(event.priority, Priority::Normal);
        assert_eq!(
            event.trace_id.to_string(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        // Unknown metadata keys survive for forwarding.
        assert_eq!(
            event.metadata_extra.get("region").and_then(|v| v.as_str()),
            Some("eu-west-1")
        );
    }

    #[test]
    fn test_missing_required_field() {
        for key in [
            "external_event_id",
            "package_uri",
            "checksum",
            "schema_version",
            "retry_count",
            "produced_at",
            "metadata",
        ] {
            let mut fields = valid_fields();
            fields.remove(key);
            let err = parse_event(&fields, &[1]).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "field {key}");
        }
    }

    #[test]
    fn test_bad_event_id_rejected() {
        for bad in [
            "rec-2025T091500Z-3f9c4241",       // short date
            "rec-20251003T091500Z-3F9C4241",   // uppercase hex
            "evt-20251003T091500Z-3f9c4241",   // wrong prefix
            "rec-20251003T091500Z-3f9c42",     // short hex
        ] {
            let mut fields = valid_fields();
            fields.insert("external_event_id".into(), bad.into());
            let err = parse_event(&fields, &[1]).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "id {bad}");
        }
    }

    #[test]
    fn test_bad_checksum_rejected() {
        for bad in [
            format!("sha256:{}", "A".repeat(64)), // uppercase
            format!("sha256:{}", "a".repeat(63)), // short
            format!("md5:{}", "a".repeat(64)),    // wrong algo
            "a".repeat(64),                        // no prefix
        ] {
            let mut fields = valid_fields();
            fields.insert("checksum".into(), bad.clone());
            let err = parse_event(&fields, &[1]).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "checksum {bad}");
        }
    }

    #[test]
    fn test_unknown_major_has_dedicated_code() {
        let mut fields = valid_fields();
        fields.insert("schema_version".into(), "2.0".into());
        let err = parse_event(&fields, &[1]).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownSchemaMajor);

        // Same version parses fine once the major is accepted.
        assert!(parse_event(&fields, &[1, 2]).is_ok());
    }

    #[test]
    fn test_malformed_version_is_validation_error() {
        for bad in ["1", "1.x", "v1.1", "1.1.3", ""] {
            let mut fields = valid_fields();
            fields.insert("schema_version".into(), bad.into());
            let err = parse_event(&fields, &[1]).unwrap_err();
            assert_eq!(err.code, ErrorCode::ValidationError, "version {bad}");
        }
    }

    #[test]
    fn test_retry_count_bounds() {
        let mut fields = valid_fields();
        fields.insert("retry_count".into(), "10".into());
        assert!(parse_event(&fields, &[1]).is_ok());

        fields.insert("retry_count".into(), "11".into());
        assert!(parse_event(&fields, &[1]).is_err());

        fields.insert("retry_count".into(), "-1".into());
        assert!(parse_event(&fields, &[1]).is_err());
    }

    #[test]
    fn test_missing_trace_id_rejected() {
        let mut fields = valid_fields();
        fields.insert("metadata".into(), r#"{"region":"eu-west-1"}"#.into());
        let err = parse_event(&fields, &[1]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("trace_id"));
    }

    #[test]
    fn test_uri_split_edge_cases() {
        let mut fields = valid_fields();
        for bad in ["ingestion/key.tar.gz", "minio://", "minio:///key", "minio://bucket/"] {
            fields.insert("package_uri".into(), bad.into());
            assert!(parse_event(&fields, &[1]).is_err(), "uri {bad}");
        }
    }

    #[test]
    fn test_supports_annotations_boundary() {
        assert!(!SchemaVersion { major: 1, minor: 0 }.supports_annotations());
        assert!(SchemaVersion { major: 1, minor: 1 }.supports_annotations());
        assert!(SchemaVersion { major: 1, minor: 2 }.supports_annotations());
        assert!(SchemaVersion { major: 2, minor: 0 }.supports_annotations());
    }

    #[test]
    fn test_flat_fields_round_trip() {
        let event = parse_event(&valid_fields(), &[1]).unwrap();
        let flat: HashMap<String, String> = event.to_flat_fields().into_iter().collect();
        let reparsed = parse_event(&flat, &[1]).unwrap();
        assert_eq!(reparsed.external_event_id, event.external_event_id);
        assert_eq!(reparsed.checksum_hex, event.checksum_hex);
        assert_eq!(reparsed.trace_id, event.trace_id);
        assert_eq!(
            reparsed.metadata_extra.get("region"),
            event.metadata_extra.get("region")
        );
    }

    #[test]
    fn test_embedded_timestamp_extraction() {
        let ts = embedded_timestamp("rec-20251003T091500Z-3f9c4241").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-10-03T09:15:00+00:00");
    }
}
