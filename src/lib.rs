//! # RAG Ingest
//!
//! **The reliable, message-driven ingestion core of the conversation RAG
//! platform.**
//!
//! A worker process consumes conversation-package events from a Redis
//! Stream, retrieves each package from S3-compatible object storage,
//! verifies it at three checksum levels, validates the conversation
//! document, enriches it (chunking, embeddings, sentiment, entities), and
//! persists the results to Postgres and Qdrant — with dead-lettering,
//! Prometheus metrics, and trace-correlated logging throughout.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │ Redis      │──▶│ Fetch +  │──▶│ Validate │──▶│ Enrich    │
//! │ Stream     │   │ Verify   │   │ Document │   │ Chunk/NLP │
//! │ (consumer  │   │ (MinIO,  │   │ (schema, │   │ (embed,   │
//! │  group)    │   │ sha-256) │   │  invars) │   │  NER, ...)│
//! └─────┬──────┘   └──────────┘   └──────────┘   └─────┬─────┘
//!       │                                              │
//!       │ non-retryable / retry-exhausted        ┌─────┴─────┐
//!       ▼                                        ▼           ▼
//! ┌────────────┐                          ┌──────────┐ ┌──────────┐
//! │ DLQ stream │                          │ Postgres │ │  Qdrant  │
//! └────────────┘                          │ jobs/rows│ │  points  │
//!                                         └──────────┘ └──────────┘
//! ```
//!
//! ## Event lifecycle
//!
//! ```text
//! received → parsed → duplicate? ──yes→ acked (skipped)
//!                          │no
//!                          ▼
//!                   downloading → normalizing → embedding → completed → acked
//!                         │            │             │
//!                         └─── any stage error ──────┘
//!                                      ▼
//!                                   retry?
//!                           yes↙            ↘no
//!                 released (re-deliver)   DLQ + acked
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration and validation |
//! | [`error`] | Error-code taxonomy, retryability, remediation hints |
//! | [`event`] | Envelope parsing and validation (C2) |
//! | [`consumer`] | Consumer-group read loop, ack/reclaim, backpressure (C1) |
//! | [`object_store`] | SigV4 download from S3-compatible storage (C3) |
//! | [`package`] | tar.gz extraction with layout and size guards (C3) |
//! | [`checksum`] | Archive and manifest SHA-256 verification (C4) |
//! | [`document`] | Conversation document model |
//! | [`validate`] | Structural and semantic payload validation (C5) |
//! | [`chunking`] | Strategy selection and chunk assembly (C6) |
//! | [`embedding`] | Batched, normalized embedding provider client (C6) |
//! | [`ner`] | Local named-entity extraction fallback (C6) |
//! | [`sentiment`] | Local sentiment fallback (C6) |
//! | [`enrich`] | Mode detection, annotation orchestration, aggregates (C6) |
//! | [`vector_index`] | Qdrant collection management and point writes (C6/C7) |
//! | [`store`] | Job, conversation, and turn persistence (C7) |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`router`] | Retry-vs-DLQ classification and side effects |
//! | [`metrics`] | Metric series and the Prometheus exporter |
//! | [`pipeline`] | Per-event stage orchestration with deadlines |
//! | [`context`] | Client lifecycle: init → run → teardown |

pub mod checksum;
pub mod chunking;
pub mod config;
pub mod consumer;
pub mod context;
pub mod document;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod event;
pub mod metrics;
pub mod migrate;
pub mod ner;
pub mod object_store;
pub mod package;
pub mod pipeline;
pub mod router;
pub mod sentiment;
pub mod store;
pub mod validate;
pub mod vector_index;
