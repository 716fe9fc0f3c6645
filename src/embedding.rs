//! Embedding provider client.
//!
//! A single HTTP provider produces dense vectors for chunk texts. The wire
//! shape is the OpenAI-compatible `POST /v1/embeddings` contract
//! (`{model, input}` in, `{data: [{index, embedding}]}` out), which every
//! local inference server we deploy against also speaks.
//!
//! # Behavior
//!
//! - Chunks are embedded in batches of `EMBEDDING_BATCH` texts, in
//!   `chunk_index` order; results preserve input order.
//! - Vectors are normalized to unit length before they leave this module,
//!   so cosine scoring downstream is a plain dot product.
//! - Transient failures (HTTP 429 and 5xx, network errors) retry with
//!   exponential backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped). Other 4xx
//!   fail immediately.

use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{ErrorCode, StageError, StageResult};

pub struct Embedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl Embedder {
    pub fn new(config: EmbeddingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    pub fn dims(&self) -> usize {
        self.config.dim
    }

    /// Embed all texts, batching by the configured size.
    ///
    /// Output order matches input order; the result length always equals
    /// `texts.len()`.
    pub async fn embed_all(&self, texts: &[String]) -> StageResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    /// One provider round-trip with retry/backoff.
    async fn embed_batch(&self, texts: &[String]) -> StageResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/embeddings", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut last_err: Option<StageError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            StageError::with_source(
                                ErrorCode::ProcessingFailure,
                                "embedding response was not valid JSON",
                                e,
                            )
                        })?;
                        let mut vectors =
                            parse_embeddings_response(&json, texts.len(), self.config.dim)?;
                        for vector in &mut vectors {
                            normalize_unit(vector);
                        }
                        return Ok(vectors);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(StageError::new(
                            ErrorCode::ProcessingFailure,
                            format!("embedding provider error {status}: {body_text}"),
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(StageError::new(
                        ErrorCode::ProcessingFailure,
                        format!("embedding provider rejected the request ({status}): {body_text}"),
                    ));
                }
                Err(e) => {
                    last_err = Some(StageError::with_source(
                        ErrorCode::ProcessingFailure,
                        format!("embedding provider unreachable at {}", self.config.url),
                        e,
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StageError::new(ErrorCode::ProcessingFailure, "embedding failed after retries")
        }))
    }
}

/// Parse `{data: [{index, embedding}]}`, re-ordering by `index` and
/// checking count and dimensionality.
fn parse_embeddings_response(
    json: &serde_json::Value,
    expected_count: usize,
    expected_dim: usize,
) -> StageResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            StageError::new(
                ErrorCode::ProcessingFailure,
                "embedding response missing data array",
            )
        })?;

    if data.len() != expected_count {
        return Err(StageError::new(
            ErrorCode::ProcessingFailure,
            format!(
                "embedding response has {} vectors for {} inputs",
                data.len(),
                expected_count
            ),
        ));
    }

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding: Vec<f32> = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                StageError::new(
                    ErrorCode::ProcessingFailure,
                    "embedding response entry missing embedding",
                )
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if embedding.len() != expected_dim {
            return Err(StageError::new(
                ErrorCode::ProcessingFailure,
                format!(
                    "provider returned a {}-dim vector, expected {expected_dim}",
                    embedding.len()
                ),
            ));
        }
        indexed.push((index, embedding));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize_unit(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit() {
        let mut v = vec![3.0, 4.0];
        normalize_unit(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize_unit(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_parse_response_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_embeddings_response(&json, 2, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_parse_response_count_mismatch() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0, 0.0]}]
        });
        assert!(parse_embeddings_response(&json, 2, 2).is_err());
    }

    #[test]
    fn test_parse_response_dim_mismatch() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0, 0.0, 0.5]}]
        });
        assert!(parse_embeddings_response(&json, 1, 2).is_err());
    }

    #[test]
    fn test_parse_response_missing_data() {
        let json = serde_json::json!({"error": "boom"});
        assert!(parse_embeddings_response(&json, 1, 2).is_err());
    }
}
