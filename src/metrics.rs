//! Instrumentation: metric series and the Prometheus exporter.
//!
//! All recording goes through the `metrics` facade macros; the
//! Prometheus exporter installed by [`init_metrics`] renders them on
//! `0.0.0.0:<METRICS_PORT>/metrics`. Histograms with explicit buckets
//! render as Prometheus histograms; the duration series without buckets
//! render as summaries.
//!
//! # Accounting policy
//!
//! Duplicate deliveries are *not* failures: they increment
//! `audio_ingest_duplicates_total` and leave
//! `audio_ingest_failures_total` untouched, so failure-rate alerts do not
//! fire on replays.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use crate::enrich::NlpSource;
use crate::error::ErrorCode;

pub const MESSAGES_TOTAL: &str = "audio_ingest_messages_total";
pub const FAILURES_TOTAL: &str = "audio_ingest_failures_total";
pub const DUPLICATES_TOTAL: &str = "audio_ingest_duplicates_total";
pub const MESSAGES_INFLIGHT: &str = "audio_ingest_messages_inflight";
pub const ACK_LATENCY: &str = "audio_ingest_ack_latency_seconds";
pub const VALIDATION_DURATION: &str = "audio_ingest_validation_duration_seconds";
pub const CHECKSUM_DURATION: &str = "audio_ingest_checksum_validation_duration_seconds";
pub const PROCESSING_DURATION: &str = "audio_ingest_processing_duration_seconds";
pub const NLP_DURATION: &str = "audio_ingest_nlp_duration_seconds";
pub const DOWNLOAD_SIZE: &str = "audio_ingest_download_size_bytes";
pub const CONVERSATION_SEGMENTS: &str = "audio_ingest_conversation_segments";
pub const CONVERSATION_PARTICIPANTS: &str = "audio_ingest_conversation_participants";
pub const TRACE_ID_PRESENT: &str = "audio_ingest_trace_id_present_total";
pub const DLQ_PUBLISHED: &str = "audio_ingest_dlq_published_total";
pub const RETRIES_TOTAL: &str = "audio_ingest_retries_total";
pub const NLP_SOURCE_TOTAL: &str = "audio_ingest_nlp_source_total";

/// Install the Prometheus exporter and register series metadata.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .set_buckets_for_metric(
            Matcher::Full(ACK_LATENCY.to_string()),
            &[0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(PROCESSING_DURATION.to_string()),
            &[5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(NLP_DURATION.to_string()),
            &[0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(DOWNLOAD_SIZE.to_string()),
            &[1e6, 1e7, 5e7, 1e8, 2e8, 5e8],
        )?
        .set_buckets_for_metric(
            Matcher::Full(CONVERSATION_SEGMENTS.to_string()),
            &[10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(CONVERSATION_PARTICIPANTS.to_string()),
            &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0],
        )?
        .install()?;

    describe_counter!(MESSAGES_TOTAL, "Messages read from the ingestion stream");
    describe_counter!(FAILURES_TOTAL, "Ingestion failures by error code");
    describe_counter!(
        DUPLICATES_TOTAL,
        "Re-deliveries short-circuited by an already-completed job"
    );
    describe_gauge!(MESSAGES_INFLIGHT, "Events currently being processed");
    describe_histogram!(ACK_LATENCY, "Seconds from message receipt to ack");
    describe_histogram!(
        VALIDATION_DURATION,
        "Seconds spent validating conversation.json"
    );
    describe_histogram!(
        CHECKSUM_DURATION,
        "Seconds spent on archive and manifest checksum verification"
    );
    describe_histogram!(
        PROCESSING_DURATION,
        "End-to-end seconds from download to completion"
    );
    describe_histogram!(NLP_DURATION, "Seconds spent in enrichment, by source");
    describe_histogram!(DOWNLOAD_SIZE, "Downloaded archive size in bytes");
    describe_histogram!(CONVERSATION_SEGMENTS, "Segments per conversation");
    describe_histogram!(CONVERSATION_PARTICIPANTS, "Participants per conversation");
    describe_counter!(
        TRACE_ID_PRESENT,
        "Messages whose metadata carried a trace_id"
    );
    describe_counter!(DLQ_PUBLISHED, "Messages published to the dead-letter stream");
    describe_counter!(RETRIES_TOTAL, "Retry attempts by error code");
    describe_counter!(NLP_SOURCE_TOTAL, "Jobs by NLP annotation source");

    Ok(())
}

pub fn record_message_received() {
    counter!(MESSAGES_TOTAL).increment(1);
}

pub fn record_failure(code: ErrorCode) {
    counter!(FAILURES_TOTAL, "reason" => code.as_str()).increment(1);
}

pub fn record_duplicate() {
    counter!(DUPLICATES_TOTAL).increment(1);
}

pub fn record_retry(code: ErrorCode) {
    counter!(RETRIES_TOTAL, "reason" => code.as_str()).increment(1);
}

pub fn record_dlq_published() {
    counter!(DLQ_PUBLISHED).increment(1);
}

pub fn inflight_delta(delta: i64) {
    if delta >= 0 {
        gauge!(MESSAGES_INFLIGHT).increment(delta as f64);
    } else {
        gauge!(MESSAGES_INFLIGHT).decrement((-delta) as f64);
    }
}

pub fn record_ack_latency(seconds: f64) {
    histogram!(ACK_LATENCY).record(seconds);
}

pub fn record_validation_duration(seconds: f64) {
    histogram!(VALIDATION_DURATION).record(seconds);
}

pub fn record_checksum_duration(seconds: f64) {
    histogram!(CHECKSUM_DURATION).record(seconds);
}

pub fn record_processing_duration(seconds: f64) {
    histogram!(PROCESSING_DURATION).record(seconds);
}

pub fn record_nlp_duration(source: NlpSource, seconds: f64) {
    histogram!(NLP_DURATION, "source" => source.as_str()).record(seconds);
}

pub fn record_download_size(bytes: u64) {
    histogram!(DOWNLOAD_SIZE).record(bytes as f64);
}

pub fn record_conversation_shape(segments: usize, participants: usize) {
    histogram!(CONVERSATION_SEGMENTS).record(segments as f64);
    histogram!(CONVERSATION_PARTICIPANTS).record(participants as f64);
}

pub fn record_trace_id_present() {
    counter!(TRACE_ID_PRESENT).increment(1);
}

pub fn record_nlp_source(source: NlpSource) {
    counter!(NLP_SOURCE_TOTAL, "source" => source.as_str()).increment(1);
}
