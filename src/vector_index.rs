//! Vector store client (Qdrant REST API).
//!
//! One collection holds every conversation chunk as a `(vector, payload)`
//! point. On the first write of a job the collection is created if absent
//! (vector size = embedding dimension, cosine distance) along with payload
//! indexes on `conversation_id`, `speakers`, and `trace_id`.
//!
//! Writes go through `PUT /collections/<name>/points?wait=true` in
//! `chunk_index` order, batched. The compensating path —
//! [`VectorIndex::delete_by_conversation`] — removes every point of a
//! conversation with a filtered delete so a failed job leaves no orphans.
//!
//! All failures map to the retryable `vector_index_failure`.

use serde::Serialize;
use uuid::Uuid;

use crate::config::VectorConfig;
use crate::error::{ErrorCode, StageError, StageResult};

/// Points per upsert request.
const UPSERT_BATCH: usize = 100;

/// Payload attached to every vector point.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPayload {
    pub conversation_id: Uuid,
    pub speakers: Vec<String>,
    /// `[first_segment_id, last_segment_id]` of the chunk.
    pub turn_range: (String, String),
    pub trace_id: Uuid,
    pub chunk_index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

pub struct VectorIndex {
    config: VectorConfig,
    client: reqwest::Client,
}

impl VectorIndex {
    pub fn new(config: VectorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/collections/{}",
            self.config.url.trim_end_matches('/'),
            self.config.collection
        )
    }

    fn store_err(&self, what: &str, err: impl Into<anyhow::Error>) -> StageError {
        StageError::with_source(
            ErrorCode::VectorIndexFailure,
            format!("{what} against collection '{}'", self.config.collection),
            err,
        )
    }

    /// Create the collection and its payload indexes if they do not exist.
    pub async fn ensure_collection(&self, dims: usize) -> StageResult<()> {
        let resp = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .map_err(|e| self.store_err("collection lookup failed", e))?;

        if resp.status().as_u16() == 404 {
            let body = serde_json::json!({
                "vectors": { "size": dims, "distance": "Cosine" }
            });
            let resp = self
                .client
                .put(self.collection_url())
                .json(&body)
                .send()
                .await
                .map_err(|e| self.store_err("collection create failed", e))?;
            // A concurrent worker may have won the race; 409 is fine.
            if !resp.status().is_success() && resp.status().as_u16() != 409 {
                return Err(StageError::new(
                    ErrorCode::VectorIndexFailure,
                    format!("collection create returned HTTP {}", resp.status()),
                ));
            }

            for field in ["conversation_id", "speakers", "trace_id"] {
                self.create_payload_index(field).await?;
            }
        } else if !resp.status().is_success() {
            return Err(StageError::new(
                ErrorCode::VectorIndexFailure,
                format!("collection lookup returned HTTP {}", resp.status()),
            ));
        }

        Ok(())
    }

    async fn create_payload_index(&self, field: &str) -> StageResult<()> {
        let body = serde_json::json!({
            "field_name": field,
            "field_schema": "keyword",
        });
        let resp = self
            .client
            .put(format!("{}/index", self.collection_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.store_err("payload index create failed", e))?;
        if !resp.status().is_success() && resp.status().as_u16() != 409 {
            return Err(StageError::new(
                ErrorCode::VectorIndexFailure,
                format!("payload index on '{field}' returned HTTP {}", resp.status()),
            ));
        }
        Ok(())
    }

    /// Upsert points in order, batched. The caller passes points sorted by
    /// `chunk_index`; batch boundaries preserve that order.
    pub async fn upsert_points(&self, points: &[VectorPoint]) -> StageResult<()> {
        for batch in points.chunks(UPSERT_BATCH) {
            let body = serde_json::json!({ "points": batch });
            let resp = self
                .client
                .put(format!("{}/points?wait=true", self.collection_url()))
                .json(&body)
                .send()
                .await
                .map_err(|e| self.store_err("point upsert failed", e))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(StageError::new(
                    ErrorCode::VectorIndexFailure,
                    format!(
                        "point upsert returned HTTP {status}: {}",
                        text.chars().take(300).collect::<String>()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Compensating delete: remove every point of a conversation.
    pub async fn delete_by_conversation(&self, conversation_id: Uuid) -> StageResult<()> {
        let body = serde_json::json!({ "filter": conversation_filter(conversation_id) });
        let resp = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.store_err("filtered delete failed", e))?;
        if !resp.status().is_success() {
            return Err(StageError::new(
                ErrorCode::VectorIndexFailure,
                format!("filtered delete returned HTTP {}", resp.status()),
            ));
        }
        Ok(())
    }
}

/// Qdrant filter matching every point of one conversation.
fn conversation_filter(conversation_id: Uuid) -> serde_json::Value {
    serde_json::json!({
        "must": [
            { "key": "conversation_id", "match": { "value": conversation_id.to_string() } }
        ]
    })
}
