//! Environment-driven configuration.
//!
//! All settings come from environment variables (a `.env` file is honored
//! via `dotenvy` before parsing). [`Config::from_env`] reads every knob,
//! applies defaults, and validates the combination before any client is
//! constructed — a worker with a bad config should fail at startup, not on
//! the first event.

use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub redis: RedisConfig,
    pub object_store: ObjectStoreConfig,
    pub database_url: String,
    pub vector: VectorConfig,
    pub embedding: EmbeddingConfig,
    pub nlp_enable_local: bool,
    pub processing: ProcessingConfig,
    pub metrics_port: u16,
    /// Accepted `schema_version` majors; anything else is rejected as
    /// `unknown_schema_major`.
    pub known_schema_majors: Vec<u32>,
}

/// Broker wiring: stream, consumer group, DLQ, read cadence.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub stream_name: String,
    pub consumer_group: String,
    pub dlq_stream: String,
    pub batch_size: usize,
    pub block_ms: u64,
    /// Pending entries idle longer than this are reclaimed from dead
    /// consumers and reprocessed.
    pub claim_idle: Duration,
}

/// S3-compatible object store wiring (MinIO in every deployment so far).
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub use_tls: bool,
    /// Bucket the producer contract drops packages into. Events may
    /// address other buckets; a mismatch is logged, not rejected.
    pub ingestion_bucket: String,
    /// Hard caps from the package contract.
    pub max_archive_bytes: u64,
    pub max_member_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct VectorConfig {
    pub url: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub url: String,
    pub model: String,
    pub dim: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

/// Retry, concurrency, and per-stage deadline settings.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub max_retries: u32,
    pub max_parallel_jobs: usize,
    pub shutdown_grace: Duration,
    /// Manifest self-listing policy: when true, `checksums.sha256` must
    /// list itself (the line is skipped during verification, not hashed).
    pub manifest_requires_self: bool,
    pub deadlines: StageDeadlines,
}

/// Per-stage deadlines; exceeding one maps to `ingestion_timeout`.
#[derive(Debug, Clone)]
pub struct StageDeadlines {
    pub parse: Duration,
    pub download: Duration,
    pub checksum: Duration,
    pub validate: Duration,
    pub chunk_embed: Duration,
    pub ner: Duration,
    pub sentiment: Duration,
    pub persist: Duration,
    pub vector_write: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            parse: Duration::from_millis(100),
            download: Duration::from_secs(60),
            checksum: Duration::from_secs(30),
            validate: Duration::from_secs(5),
            chunk_embed: Duration::from_secs(120),
            ner: Duration::from_secs(60),
            sentiment: Duration::from_secs(60),
            persist: Duration::from_secs(10),
            vector_write: Duration::from_secs(30),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}='{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

fn default_parallel_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(4)
}

impl Config {
    /// Load and validate the full configuration from the environment.
    ///
    /// # Errors
    ///
    /// Fails when a required variable is missing (`DATABASE_URL`), a value
    /// does not parse, or a combination is unusable (zero batch size, empty
    /// schema-major list, embedding dim of 0).
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; a malformed one is not.
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("failed to load .env file"),
        }

        let redis = RedisConfig {
            url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            stream_name: env_or("REDIS_STREAM_NAME", "audio.ingestion"),
            consumer_group: env_or("REDIS_CONSUMER_GROUP", "rag-ingestion"),
            dlq_stream: env_or("REDIS_DLQ_STREAM", "audio.ingestion.deadletter"),
            batch_size: env_parse("REDIS_BATCH_SIZE", 16usize)?,
            block_ms: env_parse("REDIS_BLOCK_MS", 2000u64)?,
            claim_idle: Duration::from_secs(15 * 60),
        };

        let object_store = ObjectStoreConfig {
            endpoint: env_or("MINIO_ENDPOINT", "localhost:9000"),
            access_key: env_or("MINIO_ACCESS_KEY", "minioadmin"),
            secret_key: env_or("MINIO_SECRET_KEY", "minioadmin"),
            region: env_or("MINIO_REGION", "us-east-1"),
            use_tls: env_parse("MINIO_USE_SSL", false)?,
            ingestion_bucket: env_or("MINIO_BUCKET_INGESTION", "ingestion"),
            max_archive_bytes: 5 * 1024 * 1024 * 1024,
            max_member_bytes: 2 * 1024 * 1024 * 1024,
        };

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let vector = VectorConfig {
            url: env_or("QDRANT_URL", "http://localhost:6333"),
            collection: env_or("QDRANT_COLLECTION", "conversations"),
        };

        let embedding = EmbeddingConfig {
            url: env_or("EMBEDDING_URL", "http://localhost:11434"),
            model: env_or("EMBEDDING_MODEL", "multilingual-e5-large"),
            dim: env_parse("EMBEDDING_DIM", 1024usize)?,
            batch_size: env_parse("EMBEDDING_BATCH", 32usize)?,
            max_retries: 5,
            timeout_secs: 30,
        };

        let processing = ProcessingConfig {
            max_retries: env_parse("MAX_RETRIES", 3u32)?,
            max_parallel_jobs: env_parse("MAX_PARALLEL_JOBS", default_parallel_jobs())?,
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30u64)?),
            manifest_requires_self: env_parse("CHECKSUM_REQUIRE_SELF_LISTING", true)?,
            deadlines: StageDeadlines::default(),
        };

        let known_schema_majors: Vec<u32> = env_or("KNOWN_SCHEMA_MAJORS", "1")
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<u32>()
                    .map_err(|e| anyhow::anyhow!("invalid KNOWN_SCHEMA_MAJORS entry '{s}': {e}"))
            })
            .collect::<Result<_>>()?;

        let config = Self {
            service_name: env_or("SERVICE_NAME", "rag-ingest"),
            redis,
            object_store,
            database_url,
            vector,
            embedding,
            nlp_enable_local: env_parse("NLP_ENABLE_LOCAL", true)?,
            processing,
            metrics_port: env_parse("METRICS_PORT", 9090u16)?,
            known_schema_majors,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.redis.batch_size == 0 {
            bail!("REDIS_BATCH_SIZE must be > 0");
        }
        if self.processing.max_parallel_jobs == 0 {
            bail!("MAX_PARALLEL_JOBS must be > 0");
        }
        if self.embedding.dim == 0 {
            bail!("EMBEDDING_DIM must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("EMBEDDING_BATCH must be > 0");
        }
        if self.known_schema_majors.is_empty() {
            bail!("KNOWN_SCHEMA_MAJORS must list at least one accepted major");
        }
        if self.vector.collection.is_empty() {
            bail!("QDRANT_COLLECTION must not be empty");
        }
        Ok(())
    }

    /// Stable consumer name: `<service>-<hostname>`.
    ///
    /// Must survive restarts so pending entries claimed under this name can
    /// be resumed instead of waiting out the idle-reclaim window.
    pub fn consumer_name(&self) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("{}-{}", self.service_name, host)
    }
}
