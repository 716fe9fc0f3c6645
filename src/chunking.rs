//! Conversation chunking for embedding.
//!
//! Splits a validated conversation into text chunks that preserve speaker
//! context. Four strategies exist; [`choose_strategy`] picks one per
//! conversation from its shape:
//!
//! | Condition | Strategy |
//! |-----------|----------|
//! | ≤ 2 participants and median segment ≤ 300 tokens | [`ChunkStrategy::TurnBased`] |
//! | ≥ 3 participants | [`ChunkStrategy::SpeakerGrouped`] |
//! | median segment > 600 tokens | [`ChunkStrategy::SlidingWindow`] |
//! | otherwise | [`ChunkStrategy::Semantic`] |
//!
//! Tokens are approximated by whitespace-separated words. Every chunk keeps
//! its `chunk_index` (contiguous from 0), the distinct `speaker_ids` it
//! covers, and a `turn_range` of first/last segment ids so vector payloads
//! can point back into the conversation.

use std::collections::HashMap;

use serde::Serialize;

use crate::document::Segment;

/// Merge floor for turn-based chunks and the minimum accumulation before a
/// semantic boundary may fire.
const MIN_CHUNK_TOKENS: usize = 50;

/// Hard cap for speaker-grouped runs.
const MAX_CHUNK_TOKENS: usize = 1000;

/// Sliding-window geometry.
const WINDOW_TOKENS: usize = 512;
const WINDOW_OVERLAP_TOKENS: usize = 64;

/// Strategy-selection thresholds on the median segment length.
const SHORT_SEGMENT_TOKENS: usize = 300;
const LONG_SEGMENT_TOKENS: usize = 600;

/// A semantic boundary opens when the cosine similarity between the next
/// segment and the running mean of the current chunk drops below this.
const SEMANTIC_SIMILARITY_FLOOR: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    TurnBased,
    SlidingWindow,
    SpeakerGrouped,
    Semantic,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::TurnBased => "turn_based",
            ChunkStrategy::SlidingWindow => "sliding_window",
            ChunkStrategy::SpeakerGrouped => "speaker_grouped",
            ChunkStrategy::Semantic => "semantic",
        }
    }
}

/// A unit of text assembled from contiguous segments for embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_index: usize,
    pub text: String,
    /// Distinct speakers in first-appearance order.
    pub speaker_ids: Vec<String>,
    /// `(first_segment_id, last_segment_id)` covered by this chunk.
    pub turn_range: (String, String),
}

fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn median_segment_tokens(segments: &[Segment]) -> usize {
    if segments.is_empty() {
        return 0;
    }
    let mut lengths: Vec<usize> = segments.iter().map(|s| token_count(&s.text)).collect();
    lengths.sort_unstable();
    lengths[lengths.len() / 2]
}

/// Pick the chunking strategy for a conversation.
pub fn choose_strategy(participant_count: usize, segments: &[Segment]) -> ChunkStrategy {
    let median = median_segment_tokens(segments);
    if participant_count <= 2 && median <= SHORT_SEGMENT_TOKENS {
        ChunkStrategy::TurnBased
    } else if participant_count >= 3 {
        ChunkStrategy::SpeakerGrouped
    } else if median > LONG_SEGMENT_TOKENS {
        ChunkStrategy::SlidingWindow
    } else {
        ChunkStrategy::Semantic
    }
}

/// Chunk a conversation with the given strategy.
///
/// Always yields at least one chunk for a non-empty segment list, with
/// contiguous indices starting at 0.
pub fn chunk_segments(segments: &[Segment], strategy: ChunkStrategy) -> Vec<Chunk> {
    if segments.is_empty() {
        return Vec::new();
    }
    match strategy {
        ChunkStrategy::TurnBased => chunk_turn_based(segments),
        ChunkStrategy::SpeakerGrouped => chunk_speaker_grouped(segments),
        ChunkStrategy::SlidingWindow => chunk_sliding_window(segments),
        ChunkStrategy::Semantic => chunk_semantic(segments),
    }
}

/// Accumulates segments into one pending chunk.
#[derive(Default)]
struct ChunkBuilder {
    lines: Vec<String>,
    speaker_ids: Vec<String>,
    first_segment: Option<String>,
    last_segment: Option<String>,
    tokens: usize,
}

impl ChunkBuilder {
    fn push(&mut self, segment: &Segment) {
        let line = format!("{}: {}", segment.speaker_id, segment.text);
        self.tokens += token_count(&line);
        self.lines.push(line);
        if !self.speaker_ids.contains(&segment.speaker_id) {
            self.speaker_ids.push(segment.speaker_id.clone());
        }
        if self.first_segment.is_none() {
            self.first_segment = Some(segment.segment_id.clone());
        }
        self.last_segment = Some(segment.segment_id.clone());
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn flush(&mut self, chunks: &mut Vec<Chunk>) {
        if self.is_empty() {
            return;
        }
        let first = self.first_segment.take().unwrap_or_default();
        let last = self.last_segment.take().unwrap_or_else(|| first.clone());
        chunks.push(Chunk {
            chunk_index: chunks.len(),
            text: std::mem::take(&mut self.lines).join("\n"),
            speaker_ids: std::mem::take(&mut self.speaker_ids),
            turn_range: (first, last),
        });
        self.tokens = 0;
    }
}

/// One chunk per segment, with undersized segments merged forward until the
/// accumulation reaches the minimum.
fn chunk_turn_based(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut builder = ChunkBuilder::default();

    for segment in segments {
        builder.push(segment);
        if builder.tokens >= MIN_CHUNK_TOKENS {
            builder.flush(&mut chunks);
        }
    }
    builder.flush(&mut chunks);
    chunks
}

/// Contiguous run per speaker, capped at the maximum chunk size.
fn chunk_speaker_grouped(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut builder = ChunkBuilder::default();
    let mut current_speaker: Option<&str> = None;

    for segment in segments {
        let speaker_changed = current_speaker
            .map(|s| s != segment.speaker_id)
            .unwrap_or(false);
        let line_tokens = token_count(&segment.text) + 1;
        if !builder.is_empty()
            && (speaker_changed || builder.tokens + line_tokens > MAX_CHUNK_TOKENS)
        {
            builder.flush(&mut chunks);
        }
        builder.push(segment);
        current_speaker = Some(&segment.speaker_id);
    }
    builder.flush(&mut chunks);
    chunks
}

/// Fixed-size window over the turn sequence with an overlap tail: when a
/// window fills, the trailing segments up to the overlap budget seed the
/// next one.
fn chunk_sliding_window(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut window: Vec<&Segment> = Vec::new();
    let mut window_tokens = 0usize;

    for segment in segments {
        window.push(segment);
        window_tokens += token_count(&segment.text) + 1;

        if window_tokens >= WINDOW_TOKENS {
            emit_window(&window, &mut chunks);

            // Keep the tail for overlap.
            let mut tail: Vec<&Segment> = Vec::new();
            let mut tail_tokens = 0usize;
            for seg in window.iter().rev() {
                let t = token_count(&seg.text) + 1;
                if tail_tokens + t > WINDOW_OVERLAP_TOKENS {
                    break;
                }
                tail_tokens += t;
                tail.push(seg);
            }
            tail.reverse();
            window = tail;
            window_tokens = tail_tokens;
        }
    }

    // Emit the remainder unless it is pure overlap of the previous window.
    let is_pure_overlap = !chunks.is_empty()
        && window
            .last()
            .map(|seg| seg.segment_id == chunks[chunks.len() - 1].turn_range.1)
            .unwrap_or(true);
    if !window.is_empty() && !is_pure_overlap {
        emit_window(&window, &mut chunks);
    }
    if chunks.is_empty() {
        emit_window(&window, &mut chunks);
    }
    chunks
}

fn emit_window(window: &[&Segment], chunks: &mut Vec<Chunk>) {
    let mut builder = ChunkBuilder::default();
    for segment in window {
        builder.push(segment);
    }
    builder.flush(chunks);
}

/// Greedy accumulation with a lexical-similarity boundary: a new chunk
/// opens when the next segment's term vector no longer resembles the
/// running mean of the current chunk.
fn chunk_semantic(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut builder = ChunkBuilder::default();
    let mut running: HashMap<String, f32> = HashMap::new();

    for segment in segments {
        let vector = term_vector(&segment.text);
        if !builder.is_empty() && builder.tokens >= MIN_CHUNK_TOKENS {
            let similarity = sparse_cosine(&vector, &running);
            if similarity < SEMANTIC_SIMILARITY_FLOOR {
                builder.flush(&mut chunks);
                running.clear();
            }
        }
        for (term, weight) in vector {
            *running.entry(term).or_insert(0.0) += weight;
        }
        builder.push(segment);
    }
    builder.flush(&mut chunks);
    chunks
}

/// Term-frequency vector over lowercased alphanumeric tokens.
fn term_vector(text: &str) -> HashMap<String, f32> {
    let mut vector = HashMap::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.len() < 2 {
            continue;
        }
        *vector.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    vector
}

fn sparse_cosine(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    let norm_a: f32 = a.values().map(|w| w * w).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|w| w * w).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: &str, speaker: &str, text: &str) -> Segment {
        Segment {
            segment_id: id.to_string(),
            speaker_id: speaker.to_string(),
            start_ms: 0,
            end_ms: 1000,
            text: text.to_string(),
            language: "en".to_string(),
            confidence: 0.9,
            annotations: None,
        }
    }

    fn words(n: usize, word: &str) -> String {
        vec![word; n].join(" ")
    }

    #[test]
    fn test_strategy_selection_table() {
        let short = vec![segment("s0", "a", &words(10, "hi"))];
        assert_eq!(choose_strategy(2, &short), ChunkStrategy::TurnBased);
        assert_eq!(choose_strategy(1, &short), ChunkStrategy::TurnBased);

        assert_eq!(choose_strategy(3, &short), ChunkStrategy::SpeakerGrouped);
        assert_eq!(choose_strategy(5, &short), ChunkStrategy::SpeakerGrouped);

        let long = vec![segment("s0", "a", &words(700, "word"))];
        assert_eq!(choose_strategy(2, &long), ChunkStrategy::SlidingWindow);

        let medium = vec![segment("s0", "a", &words(400, "word"))];
        assert_eq!(choose_strategy(2, &medium), ChunkStrategy::Semantic);
    }

    #[test]
    fn test_indices_contiguous_for_every_strategy() {
        let segments: Vec<Segment> = (0..20)
            .map(|i| {
                segment(
                    &format!("seg-{i}"),
                    if i % 2 == 0 { "a" } else { "b" },
                    &words(60, "alpha"),
                )
            })
            .collect();

        for strategy in [
            ChunkStrategy::TurnBased,
            ChunkStrategy::SpeakerGrouped,
            ChunkStrategy::SlidingWindow,
            ChunkStrategy::Semantic,
        ] {
            let chunks = chunk_segments(&segments, strategy);
            assert!(!chunks.is_empty(), "{strategy:?} produced nothing");
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_index, i, "{strategy:?} index gap");
                assert!(!chunk.text.is_empty());
            }
        }
    }

    #[test]
    fn test_turn_based_merges_small_segments() {
        let segments = vec![
            segment("seg-0", "a", "short one"),
            segment("seg-1", "b", "another short"),
            segment("seg-2", "a", &words(80, "talk")),
        ];
        let chunks = chunk_segments(&segments, ChunkStrategy::TurnBased);
        // The two short turns merge with the long one into a single chunk.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].turn_range, ("seg-0".into(), "seg-2".into()));
        assert_eq!(chunks[0].speaker_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_turn_based_one_chunk_per_large_segment() {
        let segments: Vec<Segment> = (0..3)
            .map(|i| segment(&format!("seg-{i}"), "a", &words(100, "x")))
            .collect();
        let chunks = chunk_segments(&segments, ChunkStrategy::TurnBased);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_speaker_grouped_splits_on_speaker_change() {
        let segments = vec![
            segment("seg-0", "a", "hello there"),
            segment("seg-1", "a", "more from a"),
            segment("seg-2", "b", "now b talks"),
            segment("seg-3", "a", "back to a"),
        ];
        let chunks = chunk_segments(&segments, ChunkStrategy::SpeakerGrouped);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].speaker_ids, vec!["a".to_string()]);
        assert_eq!(chunks[1].speaker_ids, vec!["b".to_string()]);
        assert_eq!(chunks[0].turn_range, ("seg-0".into(), "seg-1".into()));
    }

    #[test]
    fn test_speaker_grouped_respects_max_size() {
        let segments: Vec<Segment> = (0..4)
            .map(|i| segment(&format!("seg-{i}"), "a", &words(400, "word")))
            .collect();
        let chunks = chunk_segments(&segments, ChunkStrategy::SpeakerGrouped);
        assert!(chunks.len() > 1, "single-speaker run should split on size");
    }

    #[test]
    fn test_sliding_window_overlaps() {
        let segments: Vec<Segment> = (0..30)
            .map(|i| segment(&format!("seg-{i}"), "a", &words(50, "token")))
            .collect();
        let chunks = chunk_segments(&segments, ChunkStrategy::SlidingWindow);
        assert!(chunks.len() >= 2);
        // Consecutive windows overlap: each one starts at or before the
        // segment the previous one ended on.
        let index_of = |id: &str| id.trim_start_matches("seg-").parse::<usize>().unwrap();
        for pair in chunks.windows(2) {
            let prev_last = index_of(&pair[0].turn_range.1);
            let next_first = index_of(&pair[1].turn_range.0);
            assert!(
                next_first <= prev_last,
                "window starting at seg-{next_first} does not overlap seg-{prev_last}"
            );
        }
    }

    #[test]
    fn test_semantic_splits_on_topic_shift() {
        let mut segments = Vec::new();
        for i in 0..3 {
            segments.push(segment(
                &format!("seg-{i}"),
                "a",
                &words(30, "budget finance quarterly revenue"),
            ));
        }
        for i in 3..6 {
            segments.push(segment(
                &format!("seg-{i}"),
                "a",
                &words(30, "kubernetes deployment rollout cluster"),
            ));
        }
        let chunks = chunk_segments(&segments, ChunkStrategy::Semantic);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].turn_range, ("seg-0".into(), "seg-2".into()));
        assert_eq!(chunks[1].turn_range, ("seg-3".into(), "seg-5".into()));
    }

    #[test]
    fn test_semantic_keeps_cohesive_talk_together() {
        let segments: Vec<Segment> = (0..6)
            .map(|i| {
                segment(
                    &format!("seg-{i}"),
                    "a",
                    &words(30, "release planning roadmap milestones"),
                )
            })
            .collect();
        let chunks = chunk_segments(&segments, ChunkStrategy::Semantic);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chunk_segments(&[], ChunkStrategy::TurnBased).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let segments: Vec<Segment> = (0..12)
            .map(|i| segment(&format!("seg-{i}"), "a", &words(70, "stable")))
            .collect();
        let a = chunk_segments(&segments, ChunkStrategy::Semantic);
        let b = chunk_segments(&segments, ChunkStrategy::Semantic);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.turn_range, y.turn_range);
        }
    }

    #[test]
    fn test_sparse_cosine_basics() {
        let a = term_vector("alpha beta gamma");
        let b = term_vector("alpha beta gamma");
        assert!((sparse_cosine(&a, &b) - 1.0).abs() < 1e-6);

        let c = term_vector("delta epsilon zeta");
        assert!(sparse_cosine(&a, &c).abs() < 1e-6);
        assert_eq!(sparse_cosine(&a, &HashMap::new()), 0.0);
    }
}
