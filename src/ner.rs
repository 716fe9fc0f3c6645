//! Local named-entity extraction.
//!
//! Deterministic lexical rules covering the entity classes the platform
//! aggregates on: PERSON, LOCATION, ORGANIZATION, DATE, TIME, MONEY, MISC.
//! Pattern classes (dates, times, amounts) come from regexes; name-like
//! classes come from capitalized-run analysis backed by small lexicons and
//! context cues (titles, "chez"/"at" + organization suffixes).
//!
//! This is the fallback path for legacy (v1.0) documents only — enriched
//! documents carry upstream annotations and skip local extraction
//! entirely. Precision is tuned above recall: a missed entity costs a
//! little aggregate quality, a bogus one pollutes topic lists.

use std::sync::OnceLock;

use regex::Regex;

use crate::document::{EntityAnnotation, EntityType};

const GIVEN_NAMES: &[&str] = &[
    "Alice", "Jean", "Marie", "Pierre", "Paul", "Sophie", "Thomas", "Julie", "Nicolas", "Emma",
    "Lucas", "Léa", "Hugo", "Chloé", "Camille", "Antoine", "John", "Mary", "David", "Sarah",
    "Michael", "Laura", "Anna", "Peter",
];

const ORG_NAMES: &[&str] = &[
    "Google", "Microsoft", "Amazon", "Apple", "Meta", "Airbus", "Renault", "Orange", "Thales",
    "Capgemini", "Datadog", "Qdrant",
];

const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Inc.", "Corp", "Corp.", "Ltd", "Ltd.", "LLC", "SARL", "SAS", "GmbH", "AG", "SA",
];

const LOCATIONS: &[&str] = &[
    "Paris", "London", "Londres", "Berlin", "Madrid", "Rome", "Lyon", "Marseille", "Toulouse",
    "Bordeaux", "Nantes", "France", "Germany", "Allemagne", "Spain", "Espagne", "Italy", "Italie",
    "Europe", "Tokyo", "Montréal",
];

const TITLES: &[&str] = &[
    "M.", "Mr", "Mr.", "Mrs", "Mrs.", "Ms", "Ms.", "Dr", "Dr.", "Mme", "Mlle", "Monsieur",
    "Madame",
];

/// Prepositions that mark the following capitalized run as a place or an
/// employer ("je travaille chez Google", "the office in Berlin").
const LOCATION_CUES: &[&str] = &["à", "in", "at", "near", "de"];
const ORG_CUES: &[&str] = &["chez", "with", "for", "pour"];

fn money_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:[$€£]\s?\d[\d\s,.]*|\b\d[\d\s,.]*\s?(?:euros?|dollars?|EUR|USD)\b)")
            .expect("static regex")
    })
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:\d{1,2}:\d{2}(?::\d{2})?|\d{1,2}\s?(?:am|pm)|\d{1,2}h(?:\d{2})?)\b")
            .expect("static regex")
    })
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Month names alone are too ambiguous ("we may need..."); a month
        // only counts with an adjacent day or year.
        let months = "january|february|march|april|may|june|july|august|september|october|\
                      november|december|janvier|février|mars|avril|mai|juin|juillet|août|\
                      septembre|octobre|novembre|décembre";
        let weekdays = "monday|tuesday|wednesday|thursday|friday|saturday|sunday|lundi|mardi|\
                        mercredi|jeudi|vendredi|samedi|dimanche";
        Regex::new(&format!(
            r"(?i)\b(?:\d{{4}}-\d{{2}}-\d{{2}}|\d{{1,2}}[/.]\d{{1,2}}[/.]\d{{2,4}}|\d{{1,2}}\s+(?:{months})(?:,?\s+\d{{4}})?|(?:{months})\s+\d{{1,2}}(?:,?\s+\d{{4}})?|(?:{weekdays}))\b"
        ))
        .expect("static regex")
    })
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-zÀ-ÖØ-öø-ÿ][A-Za-zÀ-ÖØ-öø-ÿ'\-]*\.?").expect("static regex")
    })
}

#[derive(Debug, Clone)]
struct Word {
    text: String,
    start: usize,
    end: usize,
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
}

/// Extract entities from one segment text.
pub fn extract_entities(text: &str) -> Vec<EntityAnnotation> {
    let mut entities = Vec::new();
    let mut claimed: Vec<(usize, usize)> = Vec::new();

    // Pattern classes first; capitalized-run analysis skips claimed spans
    // so "May 2025" never doubles as a person.
    for (re, entity_type) in [
        (money_re(), EntityType::Money),
        (time_re(), EntityType::Time),
        (date_re(), EntityType::Date),
    ] {
        for m in re.find_iter(text) {
            if overlaps(&claimed, m.start(), m.end()) {
                continue;
            }
            claimed.push((m.start(), m.end()));
            entities.push(EntityAnnotation {
                entity_type,
                text: m.as_str().trim().to_string(),
                start_char: Some(m.start()),
                end_char: Some(m.end()),
                confidence: Some(0.9),
            });
        }
    }

    let words: Vec<Word> = word_re()
        .find_iter(text)
        .map(|m| Word {
            text: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        })
        .collect();

    let mut i = 0;
    while i < words.len() {
        let word = &words[i];
        if !is_capitalized(&word.text)
            || TITLES.contains(&word.text.as_str())
            || overlaps(&claimed, word.start, word.end)
        {
            i += 1;
            continue;
        }

        // Grow the run of adjacent capitalized words.
        let mut j = i;
        while j + 1 < words.len()
            && is_capitalized(&words[j + 1].text)
            && !overlaps(&claimed, words[j + 1].start, words[j + 1].end)
            && words[j + 1].start <= words[j].end + 1
        {
            j += 1;
        }

        let run: Vec<&Word> = words[i..=j].iter().collect();
        let run_text: Vec<&str> = run.iter().map(|w| w.text.as_str()).collect();

        let prev = i.checked_sub(1).map(|k| words[k].text.as_str());
        let at_sentence_start = sentence_start(text, run[0].start);

        let mut skip = 0;
        let mut classified = classify_run(&run_text, prev, at_sentence_start);
        if classified.is_none() && at_sentence_start && run.len() > 1 {
            // "Ensuite Jean Dupont..." — the sentence-case word absorbs the
            // name into its run; retry without it.
            skip = 1;
            classified = classify_run(&run_text[1..], Some(run_text[0]), false);
        }

        if let Some((entity_type, confidence)) = classified {
            let start = run[skip].start;
            let end = run[run.len() - 1].end;
            claimed.push((start, end));
            entities.push(EntityAnnotation {
                entity_type,
                text: run_text[skip..].join(" ").trim_end_matches('.').to_string(),
                start_char: Some(start),
                end_char: Some(end),
                confidence: Some(confidence),
            });
        }

        i = j + 1;
    }

    entities.sort_by_key(|e| e.start_char.unwrap_or(0));
    entities
}

fn classify_run(
    run: &[&str],
    prev: Option<&str>,
    at_sentence_start: bool,
) -> Option<(EntityType, f64)> {
    let bare: Vec<String> = run
        .iter()
        .map(|w| w.trim_end_matches('.').to_string())
        .collect();

    if bare.iter().any(|w| ORG_NAMES.contains(&w.as_str()))
        || run.iter().any(|w| ORG_SUFFIXES.contains(w))
    {
        return Some((EntityType::Organization, 0.85));
    }
    if prev.map(|p| ORG_CUES.contains(&p)).unwrap_or(false) {
        return Some((EntityType::Organization, 0.6));
    }

    if bare.iter().any(|w| LOCATIONS.contains(&w.as_str())) {
        return Some((EntityType::Location, 0.85));
    }
    if prev
        .map(|p| LOCATION_CUES.contains(&p.to_lowercase().as_str()))
        .unwrap_or(false)
        && !at_sentence_start
    {
        return Some((EntityType::Location, 0.55));
    }

    if prev.map(|p| TITLES.contains(&p)).unwrap_or(false) {
        return Some((EntityType::Person, 0.9));
    }
    if bare.first().map(|w| GIVEN_NAMES.contains(&w.as_str())).unwrap_or(false) {
        return Some((EntityType::Person, 0.8));
    }

    // Mid-sentence capitalized bigrams read as names; lone capitalized
    // words we cannot place go to MISC. Sentence-initial capitals alone
    // are just sentence case.
    if !at_sentence_start {
        if run.len() >= 2 {
            return Some((EntityType::Person, 0.5));
        }
        return Some((EntityType::Misc, 0.4));
    }
    None
}

fn sentence_start(text: &str, byte_offset: usize) -> bool {
    text[..byte_offset]
        .trim_end()
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?' | ':'))
        .unwrap_or(true)
}

fn overlaps(claimed: &[(usize, usize)], start: usize, end: usize) -> bool {
    claimed.iter().any(|(s, e)| start < *e && *s < end)
}
