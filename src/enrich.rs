//! Enrichment engine: mode detection, chunking, embedding, annotations.
//!
//! For every validated conversation this module produces the derived
//! artifacts: chunks (always), dense vectors (always), per-segment
//! sentiment and entities (from upstream annotations when the document is
//! enriched, from the local analyzers when it is legacy and local NLP is
//! enabled), and the conversation-level aggregates.
//!
//! # Failure containment
//!
//! Chunking and embedding failures fail the job. NER and sentiment
//! failures do not: they set `nlp_partial` and record the error for the
//! job's metadata. The two annotation passes run concurrently and are
//! joined before anything is persisted.

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::time::timeout;
use tracing::warn;

use crate::chunking::{choose_strategy, chunk_segments, Chunk, ChunkStrategy};
use crate::config::StageDeadlines;
use crate::document::{ConversationDocument, EntityAnnotation, EntityType, Segment, SentimentLabel};
use crate::embedding::Embedder;
use crate::error::{StageError, StageResult};
use crate::ner;
use crate::sentiment;

/// Where the NLP annotations of a conversation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlpSource {
    Upstream,
    Local,
    None,
}

impl NlpSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NlpSource::Upstream => "upstream",
            NlpSource::Local => "local",
            NlpSource::None => "none",
        }
    }
}

/// Decide between upstream annotations and local computation.
///
/// Upstream wins only when the document both declares v1.1+ and actually
/// carries a non-empty annotation on some segment; a v1.1 document without
/// annotations is treated as legacy.
pub fn detect_mode(doc: &ConversationDocument, local_enabled: bool) -> NlpSource {
    let version_supports = doc
        .schema_version()
        .map(|v| v.supports_annotations())
        .unwrap_or(false);
    if version_supports && doc.has_upstream_annotations() {
        NlpSource::Upstream
    } else if local_enabled {
        NlpSource::Local
    } else {
        NlpSource::None
    }
}

/// Sentiment attached to one segment, whatever its source.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSentiment {
    pub label: SentimentLabel,
    pub stars: u8,
    pub score: f64,
}

/// A ≥ 2-star swing between consecutive annotated segments.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SentimentShift {
    pub segment_index: usize,
    pub from_stars: u8,
    pub to_stars: u8,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PersonMention {
    pub name: String,
    pub mentions: usize,
}

/// Conversation-level rollups of the per-segment annotations.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConversationAggregates {
    /// Sentiment label → segment count.
    pub sentiment_distribution: BTreeMap<String, usize>,
    pub avg_stars: Option<f64>,
    pub overall_sentiment: Option<String>,
    pub sentiment_shifts: Vec<SentimentShift>,
    /// Entity type → mention count.
    pub entity_type_counts: BTreeMap<String, usize>,
    /// Top 5 persons by mention count.
    pub top_persons: Vec<PersonMention>,
}

/// Everything the enrichment engine derives for one conversation.
pub struct Enrichment {
    pub nlp_source: NlpSource,
    pub nlp_partial: bool,
    pub nlp_error: Option<String>,
    pub strategy: ChunkStrategy,
    pub chunks: Vec<Chunk>,
    /// Unit-length vectors, parallel to `chunks`.
    pub vectors: Vec<Vec<f32>>,
    /// Parallel to the document's segments.
    pub segment_sentiments: Vec<Option<SegmentSentiment>>,
    pub segment_entities: Vec<Vec<EntityAnnotation>>,
    pub aggregates: ConversationAggregates,
    pub nlp_duration_ms: u64,
}

/// Run the full enrichment pass for one conversation.
pub async fn run_enrichment(
    doc: &ConversationDocument,
    embedder: &Embedder,
    local_enabled: bool,
    deadlines: &StageDeadlines,
) -> StageResult<Enrichment> {
    let started = Instant::now();
    let nlp_source = detect_mode(doc, local_enabled);

    let strategy = choose_strategy(doc.participants.len(), &doc.segments);
    let chunks = chunk_segments(&doc.segments, strategy);

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = timeout(deadlines.chunk_embed, embedder.embed_all(&texts))
        .await
        .map_err(|_| StageError::timeout("chunk_embed", deadlines.chunk_embed.as_secs_f64()))??;

    let mut nlp_partial = false;
    let mut nlp_error = None;

    let (segment_sentiments, segment_entities) = match nlp_source {
        NlpSource::Upstream => upstream_annotations(&doc.segments),
        NlpSource::Local => {
            let for_sentiment: Vec<String> =
                doc.segments.iter().map(|s| s.text.clone()).collect();
            let for_ner = for_sentiment.clone();

            let sentiment_task = timeout(
                deadlines.sentiment,
                tokio::task::spawn_blocking(move || {
                    for_sentiment
                        .iter()
                        .map(|text| {
                            let verdict = sentiment::analyze_text(text);
                            SegmentSentiment {
                                label: verdict.label,
                                stars: verdict.stars,
                                score: verdict.score,
                            }
                        })
                        .collect::<Vec<_>>()
                }),
            );
            let ner_task = timeout(
                deadlines.ner,
                tokio::task::spawn_blocking(move || {
                    for_ner
                        .iter()
                        .map(|text| ner::extract_entities(text))
                        .collect::<Vec<_>>()
                }),
            );

            let (sentiment_out, ner_out) = tokio::join!(sentiment_task, ner_task);

            let sentiments = match sentiment_out {
                Ok(Ok(values)) => values.into_iter().map(Some).collect(),
                Ok(Err(join_err)) => {
                    nlp_partial = true;
                    nlp_error = Some(format!("sentiment task failed: {join_err}"));
                    vec![None; doc.segments.len()]
                }
                Err(_) => {
                    nlp_partial = true;
                    nlp_error = Some("sentiment exceeded its deadline".to_string());
                    vec![None; doc.segments.len()]
                }
            };

            let entities = match ner_out {
                Ok(Ok(values)) => values,
                Ok(Err(join_err)) => {
                    nlp_partial = true;
                    let msg = format!("ner task failed: {join_err}");
                    nlp_error = Some(match nlp_error.take() {
                        Some(prev) => format!("{prev}; {msg}"),
                        None => msg,
                    });
                    vec![Vec::new(); doc.segments.len()]
                }
                Err(_) => {
                    nlp_partial = true;
                    let msg = "ner exceeded its deadline".to_string();
                    nlp_error = Some(match nlp_error.take() {
                        Some(prev) => format!("{prev}; {msg}"),
                        None => msg,
                    });
                    vec![Vec::new(); doc.segments.len()]
                }
            };

            (sentiments, entities)
        }
        NlpSource::None => {
            warn!(
                external_event_id = %doc.external_event_id,
                "no upstream annotations and local NLP disabled; skipping annotations"
            );
            (
                vec![None; doc.segments.len()],
                vec![Vec::new(); doc.segments.len()],
            )
        }
    };

    let aggregates = compute_aggregates(&segment_sentiments, &segment_entities);

    Ok(Enrichment {
        nlp_source,
        nlp_partial,
        nlp_error,
        strategy,
        chunks,
        vectors,
        segment_sentiments,
        segment_entities,
        aggregates,
        nlp_duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Pull annotations off the segments of an enriched document.
fn upstream_annotations(
    segments: &[Segment],
) -> (Vec<Option<SegmentSentiment>>, Vec<Vec<EntityAnnotation>>) {
    let sentiments = segments
        .iter()
        .map(|segment| {
            segment
                .annotations
                .as_ref()
                .and_then(|a| a.sentiment.as_ref())
                .map(|s| SegmentSentiment {
                    label: s.label,
                    stars: s.stars(),
                    score: s.score,
                })
        })
        .collect();

    let entities = segments
        .iter()
        .map(|segment| {
            segment
                .annotations
                .as_ref()
                .map(|a| a.entities.clone())
                .unwrap_or_default()
        })
        .collect();

    (sentiments, entities)
}

/// Roll per-segment annotations up into conversation-level aggregates.
pub fn compute_aggregates(
    sentiments: &[Option<SegmentSentiment>],
    entities: &[Vec<EntityAnnotation>],
) -> ConversationAggregates {
    let mut aggregates = ConversationAggregates::default();

    let mut star_values: Vec<(usize, u8)> = Vec::new();
    for (index, sentiment) in sentiments.iter().enumerate() {
        if let Some(s) = sentiment {
            *aggregates
                .sentiment_distribution
                .entry(s.label.as_str().to_string())
                .or_insert(0) += 1;
            star_values.push((index, s.stars));
        }
    }

    if !star_values.is_empty() {
        let avg = star_values.iter().map(|(_, s)| *s as f64).sum::<f64>()
            / star_values.len() as f64;
        aggregates.avg_stars = Some(avg);
        aggregates.overall_sentiment =
            Some(SentimentLabel::from_stars(avg.round() as u8).as_str().to_string());

        for pair in star_values.windows(2) {
            let (_, from) = pair[0];
            let (index, to) = pair[1];
            if from.abs_diff(to) >= 2 {
                aggregates.sentiment_shifts.push(SentimentShift {
                    segment_index: index,
                    from_stars: from,
                    to_stars: to,
                });
            }
        }
    }

    let mut person_counts: BTreeMap<String, usize> = BTreeMap::new();
    for segment_entities in entities {
        for entity in segment_entities {
            *aggregates
                .entity_type_counts
                .entry(entity.entity_type.as_str().to_string())
                .or_insert(0) += 1;
            if entity.entity_type == EntityType::Person {
                *person_counts.entry(entity.text.clone()).or_insert(0) += 1;
            }
        }
    }

    let mut persons: Vec<PersonMention> = person_counts
        .into_iter()
        .map(|(name, mentions)| PersonMention { name, mentions })
        .collect();
    // Count descending, then name for a stable order.
    persons.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(a.name.cmp(&b.name)));
    persons.truncate(5);
    aggregates.top_persons = persons;

    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::sample_document_json;

    fn sample() -> ConversationDocument {
        serde_json::from_value(sample_document_json()).unwrap()
    }

    fn entity(entity_type: EntityType, text: &str) -> EntityAnnotation {
        EntityAnnotation {
            entity_type,
            text: text.to_string(),
            start_char: None,
            end_char: None,
            confidence: None,
        }
    }

    #[test]
    fn test_mode_upstream_needs_version_and_annotations() {
        let doc = sample();
        assert_eq!(detect_mode(&doc, true), NlpSource::Upstream);

        // v1.0 with annotations present is still legacy.
        let mut downgraded = sample();
        downgraded.schema_version = "1.0".into();
        assert_eq!(detect_mode(&downgraded, true), NlpSource::Local);

        // v1.1 without annotations is legacy too.
        let mut bare = sample();
        for segment in &mut bare.segments {
            segment.annotations = None;
        }
        assert_eq!(detect_mode(&bare, true), NlpSource::Local);
        assert_eq!(detect_mode(&bare, false), NlpSource::None);
    }

    #[test]
    fn test_upstream_annotation_extraction() {
        let doc = sample();
        let (sentiments, entities) = upstream_annotations(&doc.segments);
        assert_eq!(sentiments.len(), 2);
        let first = sentiments[0].unwrap();
        assert_eq!(first.label, SentimentLabel::Positive);
        assert_eq!(first.stars, 4);
        assert!(sentiments[1].is_none());
        assert_eq!(entities[0].len(), 1);
        assert!(entities[1].is_empty());
    }

    #[test]
    fn test_upstream_stars_default_from_label() {
        let mut doc = sample();
        let annotations = doc.segments[0].annotations.as_mut().unwrap();
        annotations.sentiment.as_mut().unwrap().stars = None;
        let (sentiments, _) = upstream_annotations(&doc.segments);
        assert_eq!(sentiments[0].unwrap().stars, 4);
    }

    #[test]
    fn test_aggregates_distribution_and_average() {
        let sentiments = vec![
            Some(SegmentSentiment { label: SentimentLabel::Positive, stars: 4, score: 0.9 }),
            Some(SegmentSentiment { label: SentimentLabel::Positive, stars: 4, score: 0.8 }),
            Some(SegmentSentiment { label: SentimentLabel::Negative, stars: 2, score: 0.7 }),
            None,
        ];
        let aggregates = compute_aggregates(&sentiments, &[]);
        assert_eq!(aggregates.sentiment_distribution["positive"], 2);
        assert_eq!(aggregates.sentiment_distribution["negative"], 1);
        let avg = aggregates.avg_stars.unwrap();
        assert!((avg - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(aggregates.overall_sentiment.as_deref(), Some("neutral"));
    }

    #[test]
    fn test_aggregates_detect_shifts() {
        let sentiments = vec![
            Some(SegmentSentiment { label: SentimentLabel::Positive, stars: 5, score: 0.9 }),
            Some(SegmentSentiment { label: SentimentLabel::Negative, stars: 2, score: 0.8 }),
            Some(SegmentSentiment { label: SentimentLabel::Neutral, stars: 3, score: 0.6 }),
        ];
        let aggregates = compute_aggregates(&sentiments, &[]);
        assert_eq!(aggregates.sentiment_shifts.len(), 1);
        assert_eq!(aggregates.sentiment_shifts[0].segment_index, 1);
        assert_eq!(aggregates.sentiment_shifts[0].from_stars, 5);
        assert_eq!(aggregates.sentiment_shifts[0].to_stars, 2);
    }

    #[test]
    fn test_aggregates_top_persons() {
        let entities = vec![
            vec![
                entity(EntityType::Person, "Jean"),
                entity(EntityType::Person, "Alice"),
            ],
            vec![
                entity(EntityType::Person, "Jean"),
                entity(EntityType::Organization, "Google"),
            ],
            vec![
                entity(EntityType::Person, "Marie"),
                entity(EntityType::Person, "Alice"),
            ],
            vec![entity(EntityType::Person, "Jean")],
        ];
        let aggregates = compute_aggregates(&[], &entities);
        assert_eq!(aggregates.entity_type_counts["PERSON"], 6);
        assert_eq!(aggregates.entity_type_counts["ORGANIZATION"], 1);
        assert_eq!(aggregates.top_persons[0].name, "Jean");
        assert_eq!(aggregates.top_persons[0].mentions, 3);
        // Alice (2) before Marie (1).
        assert_eq!(aggregates.top_persons[1].name, "Alice");
        assert_eq!(aggregates.top_persons[2].name, "Marie");
    }

    #[test]
    fn test_top_persons_capped_at_five() {
        let entities: Vec<Vec<EntityAnnotation>> = (0..8)
            .map(|i| vec![entity(EntityType::Person, &format!("Person{i}"))])
            .collect();
        let aggregates = compute_aggregates(&[], &entities);
        assert_eq!(aggregates.top_persons.len(), 5);
    }

    #[test]
    fn test_empty_aggregates() {
        let aggregates = compute_aggregates(&[], &[]);
        assert!(aggregates.avg_stars.is_none());
        assert!(aggregates.overall_sentiment.is_none());
        assert!(aggregates.sentiment_distribution.is_empty());
        assert!(aggregates.top_persons.is_empty());
    }
}
