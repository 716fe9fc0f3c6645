//! S3-compatible object store client (MinIO in practice).
//!
//! Downloads package archives using the S3 REST API with AWS Signature V4
//! authentication, streaming the body straight to disk. Uses only
//! pure-Rust dependencies (`hmac`, `sha2`) for signing — no C library
//! dependencies, so the worker builds everywhere.
//!
//! Requests are addressed path-style (`http://<endpoint>/<bucket>/<key>`),
//! which is what MinIO and LocalStack expect.
//!
//! # Error mapping
//!
//! | Condition | Code |
//! |-----------|------|
//! | connect/transport failure, HTTP 5xx | `object_store_unavailable` (retryable) |
//! | HTTP 404 | `object_not_found` (terminal) |
//! | declared or streamed size over the cap | `payload_too_large` (terminal) |

use std::path::Path;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::ObjectStoreConfig;
use crate::error::{ErrorCode, StageError, StageResult};

type HmacSha256 = Hmac<Sha256>;

pub struct ObjectStore {
    config: ObjectStoreConfig,
    client: reqwest::Client,
}

impl ObjectStore {
    pub fn new(config: ObjectStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> String {
        let scheme = if self.config.use_tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.config.endpoint)
    }

    fn host(&self) -> String {
        self.config.endpoint.clone()
    }

    /// Download `bucket/key` to `dest`, returning the byte count written.
    ///
    /// The caller owns `dest`'s parent directory (a per-job temp dir), so
    /// partial files left behind by a failed download disappear with it.
    pub async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StageResult<u64> {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("/{}/{}", uri_encode(bucket), encoded_key);
        let url = format!("{}{}", self.base_url(), canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.config.secret_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, credential_scope, signed_headers, signature
        );

        let resp = self
            .client
            .get(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .send()
            .await
            .map_err(|e| {
                StageError::with_source(
                    ErrorCode::ObjectStoreUnavailable,
                    format!("GET {bucket}/{key} failed to reach the object store"),
                    e,
                )
            })?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(StageError::new(
                ErrorCode::ObjectNotFound,
                format!("object '{bucket}/{key}' not found"),
            ));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::new(
                ErrorCode::ObjectStoreUnavailable,
                format!(
                    "GetObject '{bucket}/{key}' failed (HTTP {status}): {}",
                    body.chars().take(300).collect::<String>()
                ),
            ));
        }

        if let Some(declared) = resp.content_length() {
            if declared > self.config.max_archive_bytes {
                return Err(StageError::new(
                    ErrorCode::PayloadTooLarge,
                    format!(
                        "archive '{bucket}/{key}' declares {declared} bytes (cap {})",
                        self.config.max_archive_bytes
                    ),
                ));
            }
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            StageError::with_source(
                ErrorCode::ProcessingFailure,
                format!("cannot create download target '{}'", dest.display()),
                e,
            )
        })?;

        let mut written = 0u64;
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await.map_err(|e| {
            StageError::with_source(
                ErrorCode::ObjectStoreUnavailable,
                format!("download of '{bucket}/{key}' interrupted"),
                e,
            )
        })? {
            written += chunk.len() as u64;
            if written > self.config.max_archive_bytes {
                return Err(StageError::new(
                    ErrorCode::PayloadTooLarge,
                    format!(
                        "archive '{bucket}/{key}' exceeds {} bytes",
                        self.config.max_archive_bytes
                    ),
                ));
            }
            file.write_all(&chunk).await.map_err(|e| {
                StageError::with_source(
                    ErrorCode::ProcessingFailure,
                    "write to download target failed",
                    e,
                )
            })?;
        }

        file.flush().await.map_err(|e| {
            StageError::with_source(ErrorCode::ProcessingFailure, "flush of download failed", e)
        })?;

        Ok(written)
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
